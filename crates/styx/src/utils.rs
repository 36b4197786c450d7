use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a `proto!address...` listen string into the protocol and the
/// address the listener binds: `tcp!0.0.0.0!564` becomes
/// `("tcp", "0.0.0.0:564")` and `unix!/run/styxd.sock` becomes
/// `("unix", "/run/styxd.sock")`.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let (proto, rest) = arg.split_once('!')?;
    match proto {
        "tcp" => {
            let (addr, port) = rest.split_once('!')?;
            Some((proto, format!("{}:{}", addr, port)))
        }
        "unix" => Some((proto, rest.to_owned())),
        _ => None,
    }
}
