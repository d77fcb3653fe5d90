use osquery_broker::config::file_checksum;
use std::path::Path;

pub(crate) fn cmd_checksum(binary: &Path) -> anyhow::Result<()> {
    let sum = file_checksum(binary)?;
    println!("{}  {}", sum, binary.display());
    Ok(())
}
