//! QR pairing-code renderings.
//!
//! Pairing data is ephemeral: renderings live in process memory only and are
//! overwritten on every pairing attempt.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use qrcode::QrCode;
use qrcode::render::svg;

/// The two renderings pushed to consumers: the raw pairing code and a
/// scannable base64 SVG data-URL.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QrRendering {
    pub code: String,
    pub base64: String,
}

pub fn render(code: &str) -> anyhow::Result<QrRendering> {
    let qr = QrCode::new(code.as_bytes())?;
    let image = qr
        .render::<svg::Color>()
        .min_dimensions(264, 264)
        .build();
    Ok(QrRendering {
        code: code.to_string(),
        base64: format!("data:image/svg+xml;base64,{}", BASE64.encode(image)),
    })
}

/// Terminal rendering with Unicode half blocks, two module rows per line,
/// including the 4-module quiet zone scanners need. Operational convenience
/// for log output, not part of any contract.
pub fn render_terminal(code: &str) -> Option<String> {
    let qr = QrCode::new(code.as_bytes()).ok()?;
    let matrix = qr.to_colors();
    let width = qr.width();
    let quiet = 4;
    let total = width + quiet * 2;

    let color_at = |x: usize, y: usize| -> qrcode::Color {
        if x < quiet || x >= quiet + width || y < quiet || y >= quiet + width {
            qrcode::Color::Light
        } else {
            matrix[(y - quiet) * width + (x - quiet)]
        }
    };

    let mut out = String::new();
    let mut y = 0;
    while y < total {
        for x in 0..total {
            let top = color_at(x, y);
            let bottom = if y + 1 < total {
                color_at(x, y + 1)
            } else {
                qrcode::Color::Light
            };
            out.push(match (top, bottom) {
                (qrcode::Color::Light, qrcode::Color::Light) => ' ',
                (qrcode::Color::Dark, qrcode::Color::Dark) => '\u{2588}',
                (qrcode::Color::Dark, qrcode::Color::Light) => '\u{2580}',
                (qrcode::Color::Light, qrcode::Color::Dark) => '\u{2584}',
            });
        }
        out.push('\n');
        y += 2;
    }
    Some(out)
}
