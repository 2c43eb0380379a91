use bincode::de::Decoder;
use bincode::error::DecodeError;
use bincode::Decode;

/// Most elements reserved up front for one decoded sequence. Longer
/// sequences grow as their elements actually arrive.
const MAX_PREALLOC: usize = 1 << 16;

/// Decode a bincode `Vec<T>`. The length prefix is read from untrusted bytes,
/// so it only bounds the loop: a forged length runs out of input and fails
/// with `UnexpectedEnd` instead of reserving memory it never fills.
pub fn decode_seq<Context, T, D>(decoder: &mut D) -> Result<Vec<T>, DecodeError>
where
    T: Decode<Context>,
    D: Decoder<Context = Context>,
{
    let len = u64::decode(decoder)?;
    let len = usize::try_from(len).map_err(|_| DecodeError::OutsideUsizeRange(len))?;
    let mut items = Vec::with_capacity(len.min(MAX_PREALLOC));
    for _ in 0..len {
        items.push(T::decode(decoder)?);
    }
    Ok(items)
}

/// `Option<Vec<T>>` in bincode's layout: a `0`/`1` tag, then the sequence.
pub fn decode_opt_seq<Context, T, D>(decoder: &mut D) -> Result<Option<Vec<T>>, DecodeError>
where
    T: Decode<Context>,
    D: Decoder<Context = Context>,
{
    match u8::decode(decoder)? {
        0 => Ok(None),
        1 => decode_seq(decoder).map(Some),
        tag => Err(DecodeError::OtherString(format!("bad option tag {}", tag))),
    }
}

pub fn decode_string<Context, D>(decoder: &mut D) -> Result<String, DecodeError>
where
    D: Decoder<Context = Context>,
{
    let bytes: Vec<u8> = decode_seq(decoder)?;
    String::from_utf8(bytes).map_err(|e| DecodeError::OtherString(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bincode::config;
    use bincode::de::DecoderImpl;
    use bincode::de::read::SliceReader;

    fn seq_from(bytes: &[u8]) -> Result<Vec<u32>, DecodeError> {
        let mut decoder = DecoderImpl::new(SliceReader::new(bytes), config::standard(), ());
        decode_seq(&mut decoder)
    }

    #[test]
    fn test_matches_vec_layout() {
        let values: Vec<u32> = vec![0, 7, 300, u32::MAX];
        let bytes = bincode::encode_to_vec(&values, config::standard()).unwrap();
        assert_eq!(seq_from(&bytes).unwrap(), values);

        let text = "2026-10-19T00:00:00+00:00".to_string();
        let bytes = bincode::encode_to_vec(&text, config::standard()).unwrap();
        let mut decoder = DecoderImpl::new(SliceReader::new(&bytes), config::standard(), ());
        assert_eq!(decode_string(&mut decoder).unwrap(), text);

        let labels: Option<Vec<u32>> = Some(vec![1, 2]);
        let bytes = bincode::encode_to_vec(&labels, config::standard()).unwrap();
        let mut decoder = DecoderImpl::new(SliceReader::new(&bytes), config::standard(), ());
        assert_eq!(decode_opt_seq::<(), u32, _>(&mut decoder).unwrap(), labels);
    }

    #[test]
    fn test_forged_length_fails_without_allocating() {
        // 253 marks a u64 varint; eight 0xFF bytes claim u64::MAX elements.
        let mut bytes = vec![253u8];
        bytes.extend([0xFF; 8]);
        bytes.extend([1, 2, 3]);
        assert!(matches!(seq_from(&bytes), Err(DecodeError::UnexpectedEnd { .. })));
    }
}
