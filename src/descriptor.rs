use crate::{Error, Result};

/// Summary of a JVM method descriptor, enough for stack bookkeeping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MethodDescriptorSummary {
    pub param_count: usize,
    pub returns_value: bool,
}

/// Parse a method descriptor like `(I[Ljava/lang/String;J)V` into a summary.
pub fn method_descriptor_summary(descriptor: &str) -> Result<MethodDescriptorSummary> {
    let bytes = descriptor.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(malformed(descriptor));
    }

    let mut index = 1;
    let mut param_count = 0;
    loop {
        match bytes.get(index) {
            Some(b')') => {
                index += 1;
                break;
            }
            Some(_) => {
                index = skip_field_type(bytes, index).ok_or_else(|| malformed(descriptor))?;
                param_count += 1;
            }
            None => return Err(malformed(descriptor)),
        }
    }

    let returns_value = match bytes.get(index) {
        Some(b'V') => false,
        Some(_) => {
            let end = skip_field_type(bytes, index).ok_or_else(|| malformed(descriptor))?;
            if end != bytes.len() {
                return Err(malformed(descriptor));
            }
            true
        }
        None => return Err(malformed(descriptor)),
    };
    if !returns_value && index + 1 != bytes.len() {
        return Err(malformed(descriptor));
    }

    Ok(MethodDescriptorSummary {
        param_count,
        returns_value,
    })
}

pub fn method_param_count(descriptor: &str) -> Result<usize> {
    Ok(method_descriptor_summary(descriptor)?.param_count)
}

pub fn returns_value(descriptor: &str) -> Result<bool> {
    Ok(method_descriptor_summary(descriptor)?.returns_value)
}

/// Advance past one field type starting at `index`, or `None` on garbage.
fn skip_field_type(bytes: &[u8], mut index: usize) -> Option<usize> {
    while bytes.get(index) == Some(&b'[') {
        index += 1;
    }
    match bytes.get(index)? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' => Some(index + 1),
        b'L' => {
            let semicolon = bytes[index..].iter().position(|byte| *byte == b';')?;
            Some(index + semicolon + 1)
        }
        _ => None,
    }
}

fn malformed(descriptor: &str) -> Error {
    Error::MalformedBytecode(format!("invalid method descriptor: {descriptor}"))
}
