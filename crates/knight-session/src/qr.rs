//! Terminal rendering of pairing codes.

use knight_core::error::KnightError;
use qrcode::{Color, EcLevel, QrCode};

/// Light modules around the symbol so scanners can find its edges.
const QUIET_ZONE: usize = 2;

/// Render `payload` as a QR code with Unicode half-blocks, two module rows
/// per text line.
pub fn render_pairing_qr(payload: &str) -> Result<String, KnightError> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::L)
        .map_err(|e| KnightError::Transport(format!("pairing QR failed: {e}")))?;

    let width = code.width();
    let colors = code.into_colors();
    let size = width + QUIET_ZONE * 2;
    let dark = |row: usize, col: usize| {
        let (Some(r), Some(c)) = (row.checked_sub(QUIET_ZONE), col.checked_sub(QUIET_ZONE)) else {
            return false;
        };
        r < width && c < width && colors[r * width + c] == Color::Dark
    };

    let mut out = String::with_capacity((size + 1) * size.div_ceil(2));
    for row in (0..size).step_by(2) {
        for col in 0..size {
            out.push(match (dark(row, col), dark(row + 1, col)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_pairing_qr() {
        let qr = render_pairing_qr("2@pairing-ref,abc,def").unwrap();
        let lines: Vec<&str> = qr.lines().collect();
        assert!(!lines.is_empty());
        let width = lines[0].chars().count();
        assert!(lines.iter().all(|l| l.chars().count() == width));
        // Half-height rendering.
        assert!(lines.len() <= width.div_ceil(2) + 1);
        assert!(qr.contains('█') || qr.contains('▀') || qr.contains('▄'));
        // Quiet zone: the first line is blank.
        assert!(lines[0].chars().all(|c| c == ' '));
    }
}
