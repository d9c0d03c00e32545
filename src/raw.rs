use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

use crate::desc::DescriptorOps;
use crate::scoring::ScoringType;
use crate::vocab::{Node, Vocabulary, VocabularyParams, WeightingType, NO_PARENT};
use crate::*;

const MAGIC: &[u8; 4] = b"ABOW";
const VERSION: u32 = 1;
const HEADER_BYTES: usize = 26;
const MAX_RESERVED_NODES: usize = 1 << 16;

/// Vocabulary serialization
impl<D: DescriptorOps> Vocabulary<D> {
    /// Save vocabulary to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> BowResult<()> {
        let bytes = self.to_bytes()?;
        let mut file = std::fs::File::create(path.as_ref())?;
        file.write_all(&bytes)?;
        info!(path = %path.as_ref().display(), bytes = bytes.len(), "vocabulary saved");
        Ok(())
    }

    /// Load a vocabulary from a file
    pub fn load<P: AsRef<Path>>(file: P) -> BowResult<Self> {
        let mut buffer: Vec<u8> = Vec::new();
        std::fs::File::open(file.as_ref())?.read_to_end(&mut buffer)?;
        let v = Self::from_bytes(&buffer)?;
        info!(
            path = %file.as_ref().display(),
            words = v.word_count(),
            "vocabulary loaded"
        );
        Ok(v)
    }

    pub fn to_bytes(&self) -> BowResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_BYTES + self.node_count() * record_bytes::<D>());
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    /// Parse a complete serialized vocabulary. Trailing bytes are an error.
    pub fn from_bytes(mut bytes: &[u8]) -> BowResult<Self> {
        if let Some(count) = bytes.get(HEADER_BYTES - 4..HEADER_BYTES) {
            let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]) as usize;
            let available = (bytes.len() - HEADER_BYTES) / record_bytes::<D>();
            if count > available {
                return Err(format_err(format!(
                    "header announces {} nodes, data holds {}",
                    count, available
                )));
            }
        }
        let v = Self::read_from(&mut bytes)?;
        if !bytes.is_empty() {
            return Err(format_err(format!(
                "{} trailing bytes after the last node",
                bytes.len()
            )));
        }
        Ok(v)
    }

    /// Write the raw layout: a header, then one record per node in id order.
    ///
    /// ```text
    /// magic        4 bytes  "ABOW"
    /// version      u32
    /// k            u32
    /// depth        u32
    /// weighting    u8
    /// scoring      u8
    /// desc_bytes   u32
    /// node_count   u32
    ///   node_id    u32
    ///   parent_id  u32      u32::MAX for the root
    ///   descriptor [u8; desc_bytes]
    ///   weight     f64
    ///   is_leaf    u8
    /// ```
    ///
    /// All integers and floats are little-endian.
    pub fn write_to<W: Write>(&self, w: &mut W) -> BowResult<()> {
        self.ensure_trained()?;
        let params = self.params();
        w.write_all(MAGIC)?;
        w.write_all(&VERSION.to_le_bytes())?;
        w.write_all(&params.k.to_le_bytes())?;
        w.write_all(&params.depth.to_le_bytes())?;
        w.write_all(&[params.weighting.to_code(), params.scoring.to_code()])?;
        w.write_all(&(D::BYTES as u32).to_le_bytes())?;
        w.write_all(&(self.node_count() as u32).to_le_bytes())?;

        for node in self.nodes() {
            w.write_all(&node.id.to_le_bytes())?;
            w.write_all(&node.parent.unwrap_or(NO_PARENT).to_le_bytes())?;
            w.write_all(&D::to_binary(&node.descriptor))?;
            w.write_all(&node.weight.to_le_bytes())?;
            w.write_all(&[node.children.is_empty() as u8])?;
        }
        Ok(())
    }

    /// Read one serialized vocabulary from the stream, validating that the
    /// header and the node records describe a well-formed tree.
    pub fn read_from<R: Read>(r: &mut R) -> BowResult<Self> {
        let magic: [u8; 4] = read_array(r)?;
        if &magic != MAGIC {
            return Err(format_err("not a vocabulary file (bad magic)".to_string()));
        }
        let version = read_u32(r)?;
        if version != VERSION {
            return Err(format_err(format!("unsupported format version {}", version)));
        }

        let k = read_u32(r)?;
        let depth = read_u32(r)?;
        let [weighting, scoring]: [u8; 2] = read_array(r)?;
        let weighting = WeightingType::from_code(weighting)
            .ok_or_else(|| format_err(format!("unknown weighting type {}", weighting)))?;
        let scoring = ScoringType::from_code(scoring)
            .ok_or_else(|| format_err(format!("unknown scoring type {}", scoring)))?;
        let params = VocabularyParams::new(k, depth)
            .weighting(weighting)
            .scoring(scoring);
        params.validate().map_err(|e| format_err(e.to_string()))?;

        let desc_bytes = read_u32(r)? as usize;
        if desc_bytes != D::BYTES {
            return Err(format_err(format!(
                "descriptor width {} does not match expected {}",
                desc_bytes,
                D::BYTES
            )));
        }
        let node_count = read_u32(r)?;
        let max_nodes = params.max_nodes().unwrap_or(0);
        if node_count == 0 || node_count > max_nodes {
            return Err(format_err(format!(
                "node count {} outside 1..={} for a {}^{} tree",
                node_count, max_nodes, k, depth
            )));
        }

        // The count is untrusted until the records are actually read.
        let reserve = (node_count as usize).min(MAX_RESERVED_NODES);
        let mut nodes: Vec<Node<D::Descriptor>> = Vec::with_capacity(reserve);
        let mut levels: Vec<u32> = Vec::with_capacity(reserve);
        let mut leaf_flags: Vec<bool> = Vec::with_capacity(reserve);
        let mut desc_buf = vec![0u8; D::BYTES];
        for i in 0..node_count {
            let id = read_u32(r)?;
            let parent = read_u32(r)?;
            read_exact(r, &mut desc_buf)?;
            let descriptor = D::from_binary(&desc_buf).map_err(|e| format_err(e.to_string()))?;
            let weight = f64::from_le_bytes(read_array(r)?);
            let [leaf]: [u8; 1] = read_array(r)?;

            if id != i {
                return Err(format_err(format!("node {} stored at position {}", id, i)));
            }
            if !weight.is_finite() {
                return Err(format_err(format!("node {} has weight {}", id, weight)));
            }
            let leaf = match leaf {
                0 => false,
                1 => true,
                other => return Err(format_err(format!("node {} leaf flag {}", id, other))),
            };

            let parent = match (i, parent) {
                (0, NO_PARENT) => None,
                (0, p) => return Err(format_err(format!("root has parent {}", p))),
                (_, p) if p >= i => {
                    return Err(format_err(format!(
                        "node {} has parent {} which does not precede it",
                        i, p
                    )))
                }
                (_, p) => Some(p),
            };
            let level = match parent {
                None => 0,
                Some(p) => {
                    let p = p as usize;
                    if leaf_flags[p] {
                        return Err(format_err(format!("node {} is a child of leaf {}", i, p)));
                    }
                    if nodes[p].children.len() >= k as usize {
                        return Err(format_err(format!("node {} has more than {} children", p, k)));
                    }
                    nodes[p].children.push(id);
                    levels[p] + 1
                }
            };
            if level > depth {
                return Err(format_err(format!("node {} is deeper than {}", id, depth)));
            }

            nodes.push(Node {
                id,
                parent,
                children: Vec::new(),
                descriptor,
                weight,
                word: None,
            });
            levels.push(level);
            leaf_flags.push(leaf);
        }

        let mut next_word: WordId = 0;
        for ((node, &leaf), &level) in nodes.iter_mut().zip(&leaf_flags).zip(&levels) {
            if leaf != node.children.is_empty() {
                return Err(format_err(format!(
                    "node {} marked {} but has {} children",
                    node.id,
                    if leaf { "leaf" } else { "inner" },
                    node.children.len()
                )));
            }
            if leaf && level != depth {
                return Err(format_err(format!(
                    "word node {} at level {}, expected {}",
                    node.id, level, depth
                )));
            }
            if leaf {
                node.word = Some(next_word);
                next_word += 1;
            }
        }

        Ok(Self::from_parts(params, nodes))
    }
}

/// id, parent, descriptor, weight, leaf flag
fn record_bytes<D: DescriptorOps>() -> usize {
    4 + 4 + D::BYTES + 8 + 1
}

fn format_err(msg: String) -> BowErr {
    BowErr::Format(msg)
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> BowResult<()> {
    r.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => format_err("truncated vocabulary stream".to_string()),
        _ => BowErr::Io(e),
    })
}

fn read_array<R: Read, const N: usize>(r: &mut R) -> BowResult<[u8; N]> {
    let mut buf = [0u8; N];
    read_exact(r, &mut buf)?;
    Ok(buf)
}

fn read_u32<R: Read>(r: &mut R) -> BowResult<u32> {
    Ok(u32::from_le_bytes(read_array(r)?))
}
