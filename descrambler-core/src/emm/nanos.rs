use super::EmmError;

/// Reorders a sequence of `[tag, len, data...]` elements by ascending tag,
/// keeping elements with equal tags in their original order.
pub fn sort_nanos(src: &[u8]) -> Result<Vec<u8>, EmmError> {
    let mut nanos = Vec::new();
    let mut offset = 0;
    while offset < src.len() {
        let len = match src.get(offset + 1) {
            Some(len) => usize::from(*len) + 2,
            None => return Err(EmmError::TruncatedNano(offset)),
        };
        let nano = src
            .get(offset..offset + len)
            .ok_or(EmmError::TruncatedNano(offset))?;
        nanos.push(nano);
        offset += len;
    }
    nanos.sort_by_key(|nano| nano[0]);
    Ok(nanos.concat())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorts_by_tag_stably() {
        let src = [0xa9, 0x01, 0x01, 0x90, 0x00, 0xa9, 0x02, 0x02, 0x03, 0x10, 0x01, 0xff];
        let sorted = sort_nanos(&src).unwrap();
        assert_eq!(
            sorted,
            vec![0x10, 0x01, 0xff, 0x90, 0x00, 0xa9, 0x01, 0x01, 0xa9, 0x02, 0x02, 0x03]
        );
    }

    #[test]
    fn test_truncated_nano() {
        assert_eq!(sort_nanos(&[0x90, 0x05, 0x01]), Err(EmmError::TruncatedNano(0)));
        assert_eq!(sort_nanos(&[0x90, 0x00, 0x91]), Err(EmmError::TruncatedNano(2)));
        assert_eq!(sort_nanos(&[]), Ok(Vec::new()));
    }
}
