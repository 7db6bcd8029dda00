//! ASCII armoring for serialized tokens.
//!
//! ```text
//! -----BEGIN SIGNED BLS CASH TOKEN-----
//! <base64 body, 64 columns>
//! -----END SIGNED BLS CASH TOKEN-----
//! ```
//!
//! The label on the BEGIN line doubles as the algorithm discriminant.

use crate::error::{CashError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

const BEGIN: &str = "-----BEGIN ";
const END: &str = "-----END ";
const DASHES: &str = "-----";
const LINE_WIDTH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Armored {
    pub label: String,
    pub body: Vec<u8>,
}

impl Armored {
    pub fn new(label: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            body,
        }
    }

    pub fn encode(&self) -> String {
        let b64 = STANDARD.encode(&self.body);
        let mut out = String::with_capacity(b64.len() + b64.len() / LINE_WIDTH + 80);
        out.push_str(&first_line(&self.label));
        out.push('\n');
        for chunk in b64.as_bytes().chunks(LINE_WIDTH) {
            // base64 output is always ascii
            out.push_str(&String::from_utf8_lossy(chunk));
            out.push('\n');
        }
        out.push_str(END);
        out.push_str(&self.label);
        out.push_str(DASHES);
        out.push('\n');
        out
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

        let first = lines
            .next()
            .ok_or_else(|| CashError::MalformedInput("empty armored input".into()))?;
        let label = label_of(first)?;
        let end_line = format!("{}{}{}", END, label, DASHES);

        let mut b64 = String::new();
        let mut terminated = false;
        for line in lines {
            if line == end_line {
                terminated = true;
                break;
            }
            b64.push_str(line);
        }
        if !terminated {
            return Err(CashError::MalformedInput(format!(
                "missing END line for {}",
                label
            )));
        }

        Ok(Self {
            label: label.to_string(),
            body: STANDARD.decode(b64)?,
        })
    }
}

pub fn first_line(label: &str) -> String {
    format!("{}{}{}", BEGIN, label, DASHES)
}

/// Extract the discriminant from a `-----BEGIN <LABEL>-----` line.
pub fn label_of(line: &str) -> Result<&str> {
    line.trim()
        .strip_prefix(BEGIN)
        .and_then(|rest| rest.strip_suffix(DASHES))
        .filter(|label| !label.is_empty())
        .ok_or_else(|| CashError::MalformedInput("missing BEGIN line".into()))
}
