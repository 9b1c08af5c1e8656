use bytes::{Bytes, BytesMut};

const DEFAULT_BOUNDARY: &str = "frame";
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Parse state for the MJPEG multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--frame\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of part headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting JPEG bytes until the next boundary.
    CollectingJpeg,
}

/// Incremental splitter for `multipart/x-mixed-replace` MJPEG bodies.
///
/// Feed raw HTTP body chunks with [`MjpegParser::push`] and drain complete
/// JPEG images with [`MjpegParser::next_jpeg`]. Chunks may split boundaries
/// and headers at any byte.
pub struct MjpegParser {
    boundary: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    jpeg_start: usize,
}

impl MjpegParser {
    pub fn new() -> Self {
        Self::with_boundary(DEFAULT_BOUNDARY)
    }

    /// `boundary` is the bare token from the Content-Type header, without
    /// the leading dashes.
    pub fn with_boundary(boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 4);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        marker.extend_from_slice(b"\r\n");
        Self {
            boundary: marker,
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            jpeg_start: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete JPEG, or `None` if more input is needed.
    pub fn next_jpeg(&mut self) -> Option<Bytes> {
        let marker_len = self.boundary.len();
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    if let Some(pos) = find_subsequence(&self.buffer, &self.boundary) {
                        // Discard everything up to and including the boundary
                        let _ = self.buffer.split_to(pos + marker_len);
                        self.state = ParseState::SeekingHeaderEnd;
                    } else {
                        // Keep last few bytes in case boundary spans chunks
                        if self.buffer.len() > marker_len {
                            let _ = self.buffer.split_to(self.buffer.len() - marker_len);
                        }
                        return None;
                    }
                }
                ParseState::SeekingHeaderEnd => {
                    if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        let _ = self.buffer.split_to(pos + HEADER_END.len());
                        self.jpeg_start = 0;
                        self.state = ParseState::CollectingJpeg;
                    } else {
                        return None;
                    }
                }
                ParseState::CollectingJpeg => {
                    let Some(pos) =
                        find_subsequence(&self.buffer[self.jpeg_start..], &self.boundary)
                    else {
                        // Avoid re-scanning old data on the next chunk
                        self.jpeg_start = self.buffer.len().saturating_sub(marker_len);
                        return None;
                    };

                    let jpeg_end = self.jpeg_start + pos;
                    // Strip trailing \r\n before boundary
                    let end = if jpeg_end >= 2
                        && self.buffer[jpeg_end - 2] == b'\r'
                        && self.buffer[jpeg_end - 1] == b'\n'
                    {
                        jpeg_end - 2
                    } else {
                        jpeg_end
                    };

                    let jpeg = self.buffer.split_to(end).freeze();
                    let _ = self.buffer.split_to(jpeg_end - end + marker_len);
                    self.jpeg_start = 0;
                    self.state = ParseState::SeekingHeaderEnd;

                    if !jpeg.is_empty() {
                        return Some(jpeg);
                    }
                }
            }
        }
    }
}

impl Default for MjpegParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the multipart boundary token from a Content-Type header value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        let value = value.strip_prefix("--").unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
