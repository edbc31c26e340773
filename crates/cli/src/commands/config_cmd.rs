//! `agentloom config` — Configuration commands.

use agentloom_config::AppConfig;

pub fn run(check: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !check {
        print!("{}", AppConfig::default_toml());
        return Ok(());
    }

    let path = AppConfig::config_dir().join("config.toml");
    println!("Checking {}", path.display());

    match AppConfig::load() {
        Ok(config) => {
            println!("  Config parsed successfully");
            if !config.has_api_key() {
                println!("  Warning: no API key set (AGENTLOOM_API_KEY or OPENAI_API_KEY)");
            }
            println!();
            println!("{config:#?}");
            Ok(())
        }
        Err(e) => Err(format!("Config error: {e}").into()),
    }
}
