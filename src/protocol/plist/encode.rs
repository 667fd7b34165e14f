use super::PlistValue;
use super::decode::{MAGIC, TRAILER_LEN};

/// Encode a value as a binary plist
///
/// Objects are written depth-first with the root at index 0. Strings
/// are not deduplicated.
#[must_use]
pub fn encode(value: &PlistValue) -> Vec<u8> {
    let count = count_objects(value);
    let ref_size = bytes_needed(count.saturating_sub(1) as u64);

    let mut objects = Vec::with_capacity(count);
    flatten(value, &mut objects, ref_size);

    let mut out = Vec::with_capacity(MAGIC.len() + objects.iter().map(Vec::len).sum::<usize>() + 64);
    out.extend_from_slice(MAGIC);

    let mut offsets = Vec::with_capacity(objects.len());
    for object in &objects {
        offsets.push(out.len() as u64);
        out.extend_from_slice(object);
    }

    let offset_table = out.len() as u64;
    let offset_size = bytes_needed(offset_table);
    for offset in offsets {
        write_uint(&mut out, offset, offset_size);
    }

    let mut trailer = [0u8; TRAILER_LEN];
    #[allow(clippy::cast_possible_truncation)]
    {
        trailer[6] = offset_size as u8;
        trailer[7] = ref_size as u8;
    }
    trailer[8..16].copy_from_slice(&(objects.len() as u64).to_be_bytes());
    trailer[16..24].copy_from_slice(&0u64.to_be_bytes());
    trailer[24..32].copy_from_slice(&offset_table.to_be_bytes());
    out.extend_from_slice(&trailer);

    out
}

fn count_objects(value: &PlistValue) -> usize {
    match value {
        PlistValue::Array(items) => 1 + items.iter().map(count_objects).sum::<usize>(),
        PlistValue::Dictionary(dict) => {
            1 + dict.len() + dict.values().map(count_objects).sum::<usize>()
        }
        _ => 1,
    }
}

fn bytes_needed(n: u64) -> usize {
    match n {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

#[allow(clippy::cast_possible_truncation)]
fn write_uint(out: &mut Vec<u8>, value: u64, size: usize) {
    match size {
        1 => out.push(value as u8),
        2 => out.extend_from_slice(&(value as u16).to_be_bytes()),
        4 => out.extend_from_slice(&(value as u32).to_be_bytes()),
        _ => out.extend_from_slice(&value.to_be_bytes()),
    }
}

fn push_int(out: &mut Vec<u8>, value: i64) {
    // Negative values are always stored as 8 bytes
    let Ok(unsigned) = u64::try_from(value) else {
        out.push(0x13);
        out.extend_from_slice(&value.to_be_bytes());
        return;
    };
    let size = bytes_needed(unsigned);
    let exp: u8 = match size {
        1 => 0,
        2 => 1,
        4 => 2,
        _ => 3,
    };
    out.push(0x10 | exp);
    write_uint(out, unsigned, size);
}

fn push_header(out: &mut Vec<u8>, kind: u8, len: usize) {
    if len < 0x0F {
        #[allow(clippy::cast_possible_truncation)]
        out.push((kind << 4) | len as u8);
    } else {
        out.push((kind << 4) | 0x0F);
        push_int(out, i64::try_from(len).unwrap_or(i64::MAX));
    }
}

/// Append `value` and its children, returning the object index of `value`
fn flatten(value: &PlistValue, objects: &mut Vec<Vec<u8>>, ref_size: usize) -> usize {
    let index = objects.len();
    objects.push(Vec::new());

    let mut bytes = Vec::new();
    match value {
        PlistValue::Boolean(b) => bytes.push(if *b { 0x09 } else { 0x08 }),
        PlistValue::Integer(i) => push_int(&mut bytes, *i),
        PlistValue::Real(f) => {
            bytes.push(0x23);
            bytes.extend_from_slice(&f.to_be_bytes());
        }
        PlistValue::Date(f) => {
            bytes.push(0x33);
            bytes.extend_from_slice(&f.to_be_bytes());
        }
        PlistValue::String(s) => push_string(&mut bytes, s),
        PlistValue::Data(d) => {
            push_header(&mut bytes, 0x4, d.len());
            bytes.extend_from_slice(d);
        }
        PlistValue::Array(items) => {
            let refs: Vec<usize> = items
                .iter()
                .map(|item| flatten(item, objects, ref_size))
                .collect();
            push_header(&mut bytes, 0xA, refs.len());
            for r in refs {
                write_uint(&mut bytes, r as u64, ref_size);
            }
        }
        PlistValue::Dictionary(dict) => {
            let key_refs: Vec<usize> = dict
                .keys()
                .map(|k| flatten(&PlistValue::String(k.clone()), objects, ref_size))
                .collect();
            let value_refs: Vec<usize> = dict
                .values()
                .map(|v| flatten(v, objects, ref_size))
                .collect();
            push_header(&mut bytes, 0xD, key_refs.len());
            for r in key_refs.into_iter().chain(value_refs) {
                write_uint(&mut bytes, r as u64, ref_size);
            }
        }
    }

    objects[index] = bytes;
    index
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    if s.is_ascii() {
        push_header(out, 0x5, s.len());
        out.extend_from_slice(s.as_bytes());
    } else {
        let units: Vec<u16> = s.encode_utf16().collect();
        push_header(out, 0x6, units.len());
        for unit in units {
            out.extend_from_slice(&unit.to_be_bytes());
        }
    }
}
