//! Resolved daemon configuration.
//!
//! The daemon consumes this struct fully formed; parsing configuration
//! files or evaluating operator scripts is the launcher's business.

use std::path::PathBuf;
use std::str::FromStr;

/// One exported subtree, selected by the attach name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    /// Attach name clients pass as `aname`.
    pub aname: String,
    /// Host directory backing the export.
    pub root: PathBuf,
    /// Refuse every mutating operation with `EROFS`.
    pub read_only: bool,
    /// Admit attaches without a completed auth handshake even when the
    /// server requires one globally.
    pub no_auth: bool,
    /// Require the peer to connect from a privileged (<1024) source port.
    pub private_port: bool,
}

impl FromStr for Export {
    type Err = String;

    /// `ANAME=PATH[,ro][,noauth][,privport]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (aname, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("export `{}`: expected ANAME=PATH", s))?;
        if aname.is_empty() {
            return Err(format!("export `{}`: empty aname", s));
        }

        let mut parts = rest.split(',');
        let root = parts.next().filter(|p| !p.is_empty()).ok_or_else(|| {
            format!("export `{}`: empty path", s)
        })?;

        let mut export = Export {
            aname: aname.to_owned(),
            root: PathBuf::from(root),
            read_only: false,
            no_auth: false,
            private_port: false,
        };
        for opt in parts {
            match opt {
                "ro" => export.read_only = true,
                "noauth" => export.no_auth = true,
                "privport" => export.private_port = true,
                other => return Err(format!("export `{}`: unknown option `{}`", s, other)),
            }
        }
        Ok(export)
    }
}

/// Everything the daemon needs to run, resolved.
#[derive(Clone, Debug)]
pub struct Config {
    /// Listen endpoints, `proto!address!port` form.
    pub listen: Vec<String>,
    /// Worker tasks shared by all connections.
    pub nwthread: usize,
    /// Offered msize ceiling.
    pub msize: u32,
    /// Demand a credential handshake before attach.
    pub auth_required: bool,
    /// Shared secret backing the built-in credential decoder.
    pub secret_file: Option<PathBuf>,
    /// Exported subtrees.
    pub exports: Vec<Export>,
    /// Run every operation as this user instead of the attaching one.
    pub squash_user: Option<String>,
    /// fsync the parent directory after create/rename/unlink.
    pub sync_dirs: bool,
}

impl Config {
    pub fn find_export(&self, aname: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.aname == aname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_spec_parses_options() {
        let e: Export = "home=/srv/home,ro,privport".parse().unwrap();
        assert_eq!(e.aname, "home");
        assert_eq!(e.root, PathBuf::from("/srv/home"));
        assert!(e.read_only);
        assert!(!e.no_auth);
        assert!(e.private_port);

        let e: Export = "scratch=/tmp/scratch".parse().unwrap();
        assert!(!e.read_only && !e.no_auth && !e.private_port);
    }

    #[test]
    fn export_spec_rejects_malformed_input() {
        assert!("noequals".parse::<Export>().is_err());
        assert!("=path".parse::<Export>().is_err());
        assert!("a=".parse::<Export>().is_err());
        assert!("a=/p,bogus".parse::<Export>().is_err());
    }

    #[test]
    fn find_export_matches_by_aname() {
        let cfg = Config {
            listen: vec!["tcp!0.0.0.0!564".into()],
            nwthread: 16,
            msize: 128 * 1024,
            auth_required: false,
            secret_file: None,
            exports: vec!["home=/srv/home".parse().unwrap()],
            squash_user: None,
            sync_dirs: false,
        };
        assert!(cfg.find_export("home").is_some());
        assert!(cfg.find_export("/srv/home").is_none());
    }
}
