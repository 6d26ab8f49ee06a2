//! Terminal rendering of enrollment codes.

use {
    qrcode::{QrCode, render::unicode::Dense1x2, types::QrError},
    tracing::warn,
};

/// Render `code` as a compact Unicode QR code (light-on-dark).
pub fn render_terminal(code: &str) -> Result<String, QrError> {
    let qr = QrCode::new(code.as_bytes())?;
    Ok(qr
        .render::<Dense1x2>()
        .dark_color(Dense1x2::Light)
        .light_color(Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}

/// Default enrollment renderer: print the QR code to stderr for scanning.
pub fn print_enrollment(code: &str) {
    match render_terminal(code) {
        Ok(image) => eprintln!("\nScan this QR code with the phone app to link the device:\n{image}\n"),
        Err(e) => {
            warn!(error = %e, "could not render enrollment QR code");
            eprintln!("\nEnrollment code: {code}\n");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_multiline_block() {
        let image = render_terminal("2@abcdef,ghijkl,mnopqr").unwrap();
        assert!(image.lines().count() > 10);
        assert!(image.chars().any(|c| c == '█' || c == '▀' || c == '▄'));
    }
}
