//! List export formats.

use reelout_render_engine::render_formats;

pub fn run(json: bool) -> anyhow::Result<()> {
    let summaries: Vec<_> = render_formats().iter().map(|f| f.summary()).collect();
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    println!("Export formats");
    println!("{}", "=".repeat(50));
    for summary in &summaries {
        let label = match summary.aux_label {
            Some(aux) => format!("{} ({aux})", summary.label),
            None => summary.label.clone(),
        };
        println!(
            "{label:<16} .{:<12} {}{}",
            summary.file_exts.join(" ."),
            if summary.file_sequence { "sequence" } else { "single file" },
            if summary.supports_alpha { ", alpha" } else { "" }
        );
        for property in &summary.properties {
            println!(
                "    {:<24} {} (default {})",
                property.name,
                property.options.join(" | "),
                property.default
            );
        }
    }
    Ok(())
}
