use crate::output::print_json;
use anyhow::Context;
use dglab_core::ControlIdentity;
use dglab_server::protocol::pairing_url;

pub fn run(host: &str, port: u16, id: &str, json: bool) -> anyhow::Result<()> {
    let url = pairing_url(host, port, &ControlIdentity::new(id));

    if json {
        let value = serde_json::json!({ "url": url });
        print_json(&value)?;
        return Ok(());
    }

    print_pairing(&url)
}

/// Print the pairing URL with a scannable QR code below it.
pub fn print_pairing(url: &str) -> anyhow::Result<()> {
    let qr = render_qr(url).context("failed to encode pairing URL as a QR code")?;
    println!();
    println!("  Scan with the DG-LAB app (SOCKET control):");
    println!();
    print_qr_boxed(&qr);
    println!();
    println!("  {url}");
    println!();
    Ok(())
}

fn print_qr_boxed(qr: &str) {
    let lines: Vec<&str> = qr.lines().collect();
    let content_width = lines.iter().map(|l| l.chars().count()).max().unwrap_or(0);
    // 2 spaces padding on each side
    let inner = content_width + 4;
    let border = "─".repeat(inner);

    println!("  ┌{border}┐");
    for line in &lines {
        let pad = inner.saturating_sub(line.chars().count() + 2);
        println!("  │  {line}{}│", " ".repeat(pad));
    }
    println!("  └{border}┘");
}

fn render_qr(url: &str) -> Result<String, qrcode::types::QrError> {
    use qrcode::{render::unicode, QrCode};
    let code = QrCode::new(url.as_bytes())?;
    Ok(code
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Dark)
        .light_color(unicode::Dense1x2::Light)
        .build())
}
