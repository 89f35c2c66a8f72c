//! Detection of the upstream's captcha interruption.
//!
//! When the upstream suspects automated use it answers with an ordinary chat
//! delta containing a notice, an inline base64 image, and a second notice.
//! There is no dedicated protocol signal, so detection is a fixed substring
//! match followed by a narrow capture of the image payload.

use regex_lite::Regex;
use std::sync::LazyLock;

/// "Captcha notice"
pub const NOTICE_MARKER: &str = "验证码提示";
pub const IMAGE_MARKER: &str = "![](data:image";
/// "The system has detected unusual activity on your account"
pub const ANOMALY_MARKER: &str = "系统检测到您当前存在异常";

static IMAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[\]\(data:image/[^;]+;base64,([^)]+)\)").expect("static image pattern")
});

const MARKERS: [&str; 3] = [NOTICE_MARKER, IMAGE_MARKER, ANOMALY_MARKER];

/// True when a single delta carries all three challenge markers.
pub fn is_challenge(content: &str) -> bool {
    MARKERS.iter().all(|marker| content.contains(marker))
}

/// Tracks where each marker first appeared in a text that only ever grows.
///
/// Each update rescans only the newly appended bytes plus enough overlap to
/// catch a marker straddling the previous end, so a long answer assembled
/// from many deltas is scanned once overall.
#[derive(Debug, Default)]
pub struct MarkerScan {
    found_at: [Option<usize>; 3],
    scanned: usize,
}

impl MarkerScan {
    /// `text` must extend the text passed on the previous call.
    pub fn update(&mut self, text: &str) -> bool {
        let bytes = text.as_bytes();
        for (found_at, marker) in self.found_at.iter_mut().zip(MARKERS) {
            if found_at.is_none() {
                let from = self.scanned.saturating_sub(marker.len() - 1);
                *found_at = bytes[from..]
                    .windows(marker.len())
                    .position(|w| w == marker.as_bytes())
                    .map(|pos| from + pos);
            }
        }
        self.scanned = bytes.len();
        self.complete()
    }

    pub fn complete(&self) -> bool {
        self.found_at.iter().all(Option::is_some)
    }

    /// Byte offset of the earliest marker seen so far.
    pub fn start(&self) -> Option<usize> {
        self.found_at.iter().flatten().min().copied()
    }
}

/// Base64 payload of the first inline markdown image, if any.
pub fn extract_image(content: &str) -> Option<String> {
    IMAGE_PATTERN
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
