//! Scattergram binary decompression
//!
//! Hematology analyzers transmit cell-distribution scattergrams as a
//! compact binary blob: a fixed little-endian header (width, height,
//! dictionary size), a byte/frequency table, and a body that is the
//! run-length encoding of the image compressed with a canonical Huffman
//! tree built from that table.
//!
//! Decompression never fails across the public boundary: structurally
//! inconsistent input yields a zero-filled grid of best-guess dimensions
//! and an error log line, since a corrupt scattergram must not abort the
//! surrounding message.

use bytes::Buf;
use tracing::{error, warn};

/// Largest grid accepted before input is treated as corrupt
const MAX_GRID_CELLS: usize = 4096 * 4096;

/// Decoded 2-D intensity grid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterGrid {
    pub width: usize,
    pub height: usize,
    /// Row-major intensities, `width * height` bytes
    pub data: Vec<u8>,
}

impl ScatterGrid {
    /// Zero-filled grid
    pub fn zeroed(width: usize, height: usize) -> Self {
        ScatterGrid {
            width,
            height,
            data: vec![0u8; width * height],
        }
    }

    /// Intensity at (x, y), if in bounds
    pub fn get(&self, x: usize, y: usize) -> Option<u8> {
        if x < self.width && y < self.height {
            self.data.get(y * self.width + x).copied()
        } else {
            None
        }
    }

    /// True when every cell is zero
    pub fn is_blank(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }
}

#[derive(Debug)]
enum Node {
    Leaf(u8),
    Branch(Box<Node>, Box<Node>),
}

/// Build a Huffman tree by repeatedly merging the two lowest-frequency
/// nodes. Ties break on insertion order so the tree matches the encoder.
fn build_tree(table: &[(u8, u32)]) -> Option<Node> {
    if table.is_empty() {
        return None;
    }

    // (frequency, tie-break sequence, node)
    let mut forest: Vec<(u64, u64, Node)> = table
        .iter()
        .enumerate()
        .map(|(i, &(value, freq))| (freq as u64, i as u64, Node::Leaf(value)))
        .collect();
    let mut next_seq = forest.len() as u64;

    while forest.len() > 1 {
        forest.sort_by_key(|&(freq, seq, _)| (freq, seq));
        let (f_a, _, a) = forest.remove(0);
        let (f_b, _, b) = forest.remove(0);
        forest.push((f_a + f_b, next_seq, Node::Branch(Box::new(a), Box::new(b))));
        next_seq += 1;
    }

    forest.pop().map(|(_, _, node)| node)
}

/// Walk the compressed body bit-by-bit (MSB first), descending the tree
/// and emitting a byte each time a leaf is reached.
fn huffman_decode(body: &[u8], root: &Node, expected: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(expected);
    let mut cursor = root;

    'bits: for &byte in body {
        for bit in (0..8).rev() {
            let one = (byte >> bit) & 1 == 1;
            cursor = match cursor {
                // Degenerate single-symbol dictionary: every bit emits it
                Node::Leaf(v) => {
                    out.push(*v);
                    if out.len() >= expected {
                        break 'bits;
                    }
                    continue;
                }
                Node::Branch(left, right) => {
                    if one {
                        right.as_ref()
                    } else {
                        left.as_ref()
                    }
                }
            };
            if let Node::Leaf(v) = cursor {
                out.push(*v);
                cursor = root;
                if out.len() >= expected {
                    break 'bits;
                }
            }
        }
    }

    out
}

/// Expand `(value, run_length)` pairs
fn rle_decode(pairs: &[u8], expected: usize) -> Vec<u8> {
    if pairs.len() % 2 != 0 {
        warn!(len = pairs.len(), "Odd RLE stream length, dropping trailing byte");
    }

    let mut out = Vec::with_capacity(expected);
    for chunk in pairs.chunks_exact(2) {
        let (value, run) = (chunk[0], chunk[1] as usize);
        out.extend(std::iter::repeat(value).take(run));
        if out.len() >= expected {
            break;
        }
    }
    out
}

/// Decompress an analyzer scattergram blob into an intensity grid
///
/// Input layout (all integers little-endian):
///
/// ```text
/// width:u16  height:u16  dict_len:u16
/// dict_len * (value:u8, frequency:u32)
/// huffman-compressed RLE body
/// ```
///
/// # Examples
///
/// ```
/// use lablink::scattergram::decompress;
///
/// // Truncated input degrades to an empty grid instead of failing
/// let grid = decompress(&[0x02, 0x00]);
/// assert_eq!(grid.width, 0);
/// assert!(grid.is_blank());
/// ```
pub fn decompress(bytes: &[u8]) -> ScatterGrid {
    if bytes.len() < 6 {
        error!(len = bytes.len(), "Scattergram shorter than fixed header");
        return ScatterGrid::zeroed(0, 0);
    }

    let mut buf = bytes;
    let width = buf.get_u16_le() as usize;
    let height = buf.get_u16_le() as usize;
    let dict_len = buf.get_u16_le() as usize;
    let cells = width * height;

    if cells > MAX_GRID_CELLS {
        error!(width, height, "Scattergram dimensions exceed sanity limit");
        return ScatterGrid::zeroed(0, 0);
    }

    if dict_len == 0 {
        error!(width, height, "Scattergram carries an empty Huffman dictionary");
        return ScatterGrid::zeroed(width, height);
    }

    if buf.remaining() < dict_len * 5 {
        error!(
            dict_len,
            available = buf.remaining(),
            "Scattergram dictionary exceeds available bytes"
        );
        return ScatterGrid::zeroed(width, height);
    }

    let mut table: Vec<(u8, u32)> = Vec::with_capacity(dict_len);
    for _ in 0..dict_len {
        let value = buf.get_u8();
        let freq = buf.get_u32_le();
        table.push((value, freq));
    }

    let root = match build_tree(&table) {
        Some(root) => root,
        None => {
            error!("Scattergram Huffman tree could not be built");
            return ScatterGrid::zeroed(width, height);
        }
    };

    // RLE at worst halves the data, so the pair stream is bounded by 2x cells
    let pairs = huffman_decode(buf, &root, cells * 2);
    let mut data = rle_decode(&pairs, cells);

    if data.len() < cells {
        warn!(
            decoded = data.len(),
            expected = cells,
            "Scattergram body shorter than declared grid, zero-filling"
        );
        data.resize(cells, 0);
    } else {
        data.truncate(cells);
    }

    ScatterGrid {
        width,
        height,
        data,
    }
}
