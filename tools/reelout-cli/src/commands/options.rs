//! Show legal property values around a config.

use reelout_render_model::ALL_PROPERTIES;

use super::{apply_overrides, find_format};

pub fn run(format: &str, overrides: &[String]) -> anyhow::Result<()> {
    let format = find_format(format)?;
    let config = apply_overrides(format.default_config(), overrides)?;

    println!("{}: {config}", format.label());
    if format.contains(&config) {
        println!("[OK] Config is legal");
    } else {
        println!("[WARN] Config is not legal for {}", format.label());
    }
    println!();

    for property in ALL_PROPERTIES.iter().filter(|p| format.assortment().mentions(**p)) {
        let current = config
            .value_of(*property)
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        let options: Vec<String> = format
            .assortment()
            .options_any(*property, &config, &[])
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "  {:<24} {:<14} {}",
            property.name(),
            current,
            if options.is_empty() {
                "(no legal values here)".to_string()
            } else {
                options.join(" | ")
            }
        );
    }
    Ok(())
}
