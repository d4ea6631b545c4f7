//! Wallet script-tracking collaborator
//!
//! The wallet side of the system supplies the scripts (and serialized
//! outpoints) it cares about; the node uses them to build the SPV bloom
//! filter and to test Neutrino compact filters locally. Matched transactions
//! flow back through the node callbacks.

/// Source of the scripts the sync strategies watch for.
pub trait WatchList: Send + Sync {
    /// The raw script bytes currently being watched. Called before every
    /// filter construction or match, so additions take effect on the next
    /// sync round.
    fn watched_scripts(&self) -> Vec<Vec<u8>>;
}

/// A fixed watch list, handy for the CLI and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticWatchList {
    scripts: Vec<Vec<u8>>,
}

impl StaticWatchList {
    pub fn new(scripts: Vec<Vec<u8>>) -> Self {
        Self { scripts }
    }

    /// Parse a list of hex-encoded scripts.
    pub fn from_hex<S: AsRef<str>>(scripts: &[S]) -> Result<Self, hex::FromHexError> {
        let scripts = scripts
            .iter()
            .map(|s| hex::decode(s.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { scripts })
    }
}

impl WatchList for StaticWatchList {
    fn watched_scripts(&self) -> Vec<Vec<u8>> {
        self.scripts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_scripts_are_decoded() {
        let list = StaticWatchList::from_hex(&["76a914", "00ff"]).unwrap();
        assert_eq!(
            list.watched_scripts(),
            vec![vec![0x76, 0xa9, 0x14], vec![0x00, 0xff]]
        );
    }

    #[test]
    fn invalid_hex_is_an_error() {
        assert!(StaticWatchList::from_hex(&["zz"]).is_err());
    }
}
