// ============================================
// File: crates/warren-server/src/status.rs
// ============================================
//! # Status Output
//!
//! ## Creation Reason
//! Operators watch the server through a periodically rewritten status
//! file listing every connected peer. Three historical format versions
//! are supported; the engine only supplies the fields.
//!
//! ## Main Functionality
//! - `StatusRow`: one peer's status fields
//! - `format_status`: renders rows in version 1, 2 or 3
//! - `StatusWriter`: interval-gated file rewriter
//!
//! ## Format Versions
//! - v1: human-oriented, comma separated, banner header
//! - v2: machine-oriented, `HEADER,`/`CLIENT_LIST,` tagged rows
//! - v3: like v2 but tab separated
//!
//! ## ⚠️ Important Note for Next Developer
//! - Versions are a compatibility surface; never reorder fields

use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use warren_common::time::unix_timestamp;

// ============================================
// StatusRow
// ============================================

/// Status fields of one client instance.
#[derive(Debug, Clone)]
pub struct StatusRow {
    /// Peer identity (outer address until authenticated).
    pub common_name: String,
    /// Outer transport address.
    pub real_addr: String,
    /// Assigned inner address, if established.
    pub virtual_addr: Option<String>,
    /// Bytes received from this peer.
    pub bytes_in: u64,
    /// Bytes sent to this peer.
    pub bytes_out: u64,
    /// Unix time the instance was created.
    pub connected_since: i64,
}

// ============================================
// Formatting
// ============================================

/// Renders status rows in the requested format version.
#[must_use]
pub fn format_status(version: u8, rows: &[StatusRow], now_unix: i64) -> String {
    match version {
        2 => format_tagged(rows, now_unix, ","),
        3 => format_tagged(rows, now_unix, "\t"),
        _ => format_v1(rows, now_unix),
    }
}

fn format_v1(rows: &[StatusRow], now_unix: i64) -> String {
    let mut out = String::new();
    out.push_str("WARREN CLIENT LIST\n");
    out.push_str(&format!("Updated,{now_unix}\n"));
    out.push_str(
        "Common Name,Real Address,Virtual Address,Bytes Received,Bytes Sent,Connected Since\n",
    );
    for row in rows {
        out.push_str(&format!(
            "{},{},{},{},{},{}\n",
            row.common_name,
            row.real_addr,
            row.virtual_addr.as_deref().unwrap_or(""),
            row.bytes_in,
            row.bytes_out,
            row.connected_since
        ));
    }
    out.push_str("END\n");
    out
}

fn format_tagged(rows: &[StatusRow], now_unix: i64, sep: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!("TITLE{sep}warren\n"));
    out.push_str(&format!("TIME{sep}{now_unix}\n"));
    out.push_str(&format!(
        "HEADER{sep}CLIENT_LIST{sep}Common Name{sep}Real Address{sep}Virtual Address{sep}Bytes Received{sep}Bytes Sent{sep}Connected Since\n"
    ));
    for row in rows {
        out.push_str(&format!(
            "CLIENT_LIST{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}\n",
            row.common_name,
            row.real_addr,
            row.virtual_addr.as_deref().unwrap_or(""),
            row.bytes_in,
            row.bytes_out,
            row.connected_since
        ));
    }
    out.push_str("END\n");
    out
}

// ============================================
// StatusWriter
// ============================================

/// Interval-gated status file rewriter.
#[derive(Debug)]
pub struct StatusWriter {
    path: PathBuf,
    version: u8,
    interval: Duration,
    last_write: Option<Instant>,
}

impl StatusWriter {
    /// Creates a writer for `path` in the given format version.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, version: u8, interval: Duration) -> Self {
        Self {
            path: path.into(),
            version,
            interval,
            last_write: None,
        }
    }

    /// Rewrites the file if the interval has elapsed.
    pub fn maybe_write(&mut self, rows: &[StatusRow]) {
        let due = self
            .last_write
            .map_or(true, |at| at.elapsed() >= self.interval);
        if due {
            if let Err(e) = self.write_now(rows) {
                warn!("status write to {} failed: {}", self.path.display(), e);
            }
        }
    }

    /// Rewrites the file unconditionally.
    ///
    /// # Errors
    /// Returns the underlying I/O error.
    pub fn write_now(&mut self, rows: &[StatusRow]) -> io::Result<()> {
        let content = format_status(self.version, rows, unix_timestamp());
        std::fs::write(&self.path, content)?;
        self.last_write = Some(Instant::now());
        debug!("status written: {} rows", rows.len());
        Ok(())
    }
}

// ============================================
// Tests
// ============================================
