//! Descriptor <-> BLOB encoding (little-endian f32).

use rollcall_core::Descriptor;

pub fn encode_descriptor(descriptor: &Descriptor) -> Vec<u8> {
    descriptor
        .values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

pub fn decode_descriptor(bytes: &[u8]) -> Option<Descriptor> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    let values = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some(Descriptor::new(values))
}
