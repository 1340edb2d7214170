//! Check the ffmpeg installation.

use reelout_common::DeliveryConfig;
use reelout_render_engine::{render_formats, FfmpegMuxBackend, FormatKind};

pub fn run(config: &DeliveryConfig) -> anyhow::Result<()> {
    println!("Reelout System Check");
    println!("{}", "=".repeat(50));

    let backend = FfmpegMuxBackend::from_config(config);
    let path = config.encoder.ffmpeg_path.display();
    if !backend.is_available() {
        println!("[FAIL] ffmpeg not found at {path}");
        println!("       Image sequences and timelines still work; video containers need ffmpeg.");
        return Ok(());
    }
    println!("[OK] ffmpeg: {path}");

    let encoders = backend.encoders()?;
    for format in render_formats() {
        let FormatKind::VideoContainer(codec) = format.kind() else {
            continue;
        };
        let settings = codec.encoder_settings(format.default_config(), config.encoder.prefer_hardware_encoders);
        let found: Vec<&str> = settings
            .iter()
            .map(|s| s.codec_name.as_str())
            .filter(|name| encoders.contains(*name))
            .collect();
        if found.is_empty() {
            println!("[WARN] {}: no encoder available", format.label());
        } else {
            println!("[OK] {}: {}", format.label(), found.join(", "));
        }
    }
    Ok(())
}
