//! Minimal PEM block parser.
//!
//! Handles the certificate and key files the server loads: a sequence of
//! `-----BEGIN <LABEL>-----` / `-----END <LABEL>-----` blocks with base64
//! bodies. Unknown labels are passed through for the caller to filter.

use crate::error::{ServerError, ServerResult};

/// One decoded PEM block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PemBlock {
    /// The label between BEGIN/END markers, e.g. `CERTIFICATE`.
    pub label: String,
    /// The decoded DER contents.
    pub contents: Vec<u8>,
}

/// Parses every PEM block in `data`.
pub fn parse_pem(data: &[u8]) -> ServerResult<Vec<PemBlock>> {
    let text = std::str::from_utf8(data)
        .map_err(|e| ServerError::Tls(format!("PEM file is not utf-8: {e}")))?;

    let mut blocks = Vec::new();
    let mut label: Option<String> = None;
    let mut body = String::new();

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("-----BEGIN ") {
            let name = rest
                .strip_suffix("-----")
                .ok_or_else(|| ServerError::Tls(format!("malformed PEM header: {line}")))?;
            if label.is_some() {
                return Err(ServerError::Tls("nested PEM block".into()));
            }
            label = Some(name.to_owned());
            body.clear();
        } else if let Some(rest) = line.strip_prefix("-----END ") {
            let name = rest
                .strip_suffix("-----")
                .ok_or_else(|| ServerError::Tls(format!("malformed PEM footer: {line}")))?;
            let open = label
                .take()
                .ok_or_else(|| ServerError::Tls("PEM footer without header".into()))?;
            if open != name {
                return Err(ServerError::Tls(format!(
                    "PEM footer {name} does not match header {open}"
                )));
            }
            blocks.push(PemBlock {
                label: open,
                contents: decode_base64(&body)?,
            });
        } else if label.is_some() && !line.is_empty() {
            body.push_str(line);
        }
    }

    if label.is_some() {
        return Err(ServerError::Tls("unterminated PEM block".into()));
    }
    Ok(blocks)
}

/// Decodes standard base64 with padding.
fn decode_base64(input: &str) -> ServerResult<Vec<u8>> {
    const TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut reverse = [255u8; 256];
    for (i, &c) in TABLE.iter().enumerate() {
        reverse[c as usize] = i as u8;
    }

    let input = input.trim_end_matches('=');
    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &byte in input.as_bytes() {
        let value = reverse[byte as usize];
        if value == 255 {
            return Err(ServerError::Tls(format!(
                "invalid base64 character {:?} in PEM body",
                byte as char
            )));
        }
        acc = (acc << 6) | u32::from(value);
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Ok(out)
}
