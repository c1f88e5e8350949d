use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::parameters::Parameters;

/// Settings of a [`Deployment`](crate::Deployment).
///
/// ```json
/// {
///   "journal_dir": ".deployments",
///   "max_in_flight": 4,
///   "parameters": { "$global": { "owner": "0x1234" } }
/// }
/// ```
///
/// Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root directory of the file backed journals.
    pub journal_dir: Utf8PathBuf,
    /// Upper bound on actions submitted to the chain adapter at once.
    pub max_in_flight: usize,
    /// Module parameters.
    pub parameters: Parameters,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal_dir: Utf8PathBuf::from(".deployments"),
            max_in_flight: 4,
            parameters: Parameters::default(),
        }
    }
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| anyhow::anyhow!("Couldn't read config file '{path}':\n{err}"))?;

        Self::from_json_str(&text)
            .map_err(|err| anyhow::anyhow!("Couldn't parse config file '{path}':\n{err}"))
    }
}
