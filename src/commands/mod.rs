pub(crate) mod checksum;
pub(crate) mod run;
pub(crate) mod show_args;

use osquery_broker::clienv;
use osquery_broker::BrokerConfig;
use std::path::PathBuf;

pub(crate) fn load_config(path: Option<PathBuf>) -> anyhow::Result<BrokerConfig> {
    let path = path.unwrap_or_else(clienv::config_path);
    BrokerConfig::load(&path)
}
