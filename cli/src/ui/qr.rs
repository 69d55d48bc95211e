//! Terminal QR code rendering.

use qrcode::{Color, QrCode};

/// Modules of horizontal quiet zone on each side
const QUIET_MODULES: usize = 2;

/// Print a QR code to the terminal using half-block characters, packing
/// two module rows into every text row.
pub fn print_qr_code(data: &str) {
    let code = match QrCode::new(data.as_bytes()) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Failed to generate QR code: {}", e);
            return;
        }
    };

    let width = code.width();
    let modules = code.to_colors();
    let dark_at = |x: isize, y: isize| -> bool {
        if x < 0 || y < 0 || x as usize >= width || y as usize >= width {
            return false;
        }
        modules[y as usize * width + x as usize] == Color::Dark
    };

    let quiet = QUIET_MODULES as isize;
    let mut y = -quiet;
    while y < width as isize + quiet {
        let mut line = String::with_capacity(width + 2 * QUIET_MODULES);
        for x in -quiet..width as isize + quiet {
            // ▀ top-dark, ▄ bottom-dark, █ both, space neither
            line.push(match (dark_at(x, y), dark_at(x, y + 1)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        println!("  {}", line);
        y += 2;
    }
}
