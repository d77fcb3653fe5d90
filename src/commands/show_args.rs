use std::path::PathBuf;

pub(crate) fn cmd_args(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = super::load_config(config)?;

    for raw in config.instances {
        let instance = raw.validate()?;
        println!("[{}]", instance.name);
        println!("{}", instance.binary_path.display());
        for arg in instance.args() {
            println!("  {}", arg);
        }
    }
    Ok(())
}
