//! Object codec and multi-object payload splitting.

#[cfg(test)]
mod tests {
    use crate::encoding::{Decode, Encode, EncodingError};
    use crate::object::{EncodingCodec, ObjectCodec, decode_objects};

    #[derive(Debug, PartialEq)]
    struct Event {
        id: u32,
        name: String,
    }

    impl Encode for Event {
        fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
            self.id.encode_to(buf)?;
            self.name.encode_to(buf)?;
            Ok(())
        }
    }

    impl Decode for Event {
        fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
            let mut offset = 0;
            let (id, n) = u32::decode_from(&buf[offset..])?;
            offset += n;
            let (name, n) = String::decode_from(&buf[offset..])?;
            offset += n;
            Ok((Self { id, name }, offset))
        }
    }

    fn event(id: u32, name: &str) -> Event {
        Event {
            id,
            name: name.to_string(),
        }
    }

    fn concat(codec: &mut EncodingCodec<Event>, events: &[Event]) -> Vec<u8> {
        events
            .iter()
            .flat_map(|e| codec.serialize(e).unwrap())
            .collect()
    }

    #[test]
    fn serialize_then_deserialize_one_object() {
        let mut codec = EncodingCodec::<Event>::new();
        let bytes = codec.serialize(&event(7, "start")).unwrap();
        let (decoded, used) = codec.deserialize(&bytes).unwrap();
        assert_eq!(decoded, event(7, "start"));
        assert_eq!(used, bytes.len());
        codec.reset();
    }

    #[test]
    fn splits_back_to_back_objects() {
        let mut codec = EncodingCodec::<Event>::new();
        let events = vec![event(1, "a"), event(2, "bb"), event(3, "")];
        let bytes = concat(&mut codec, &events);
        assert_eq!(decode_objects(&mut codec, &bytes, false).unwrap(), events);
    }

    #[test]
    fn empty_payload_has_no_objects() {
        let mut codec = EncodingCodec::<Event>::new();
        assert!(decode_objects(&mut codec, &[], false).unwrap().is_empty());
    }

    #[test]
    fn lenient_drops_truncated_tail() {
        let mut codec = EncodingCodec::<Event>::new();
        let mut bytes = concat(&mut codec, &[event(1, "first"), event(2, "second")]);
        bytes.truncate(bytes.len() - 3);

        let objects = decode_objects(&mut codec, &bytes, true).unwrap();
        assert_eq!(objects, vec![event(1, "first")]);
    }

    #[test]
    fn strict_reports_truncated_tail() {
        let mut codec = EncodingCodec::<Event>::new();
        let mut bytes = concat(&mut codec, &[event(1, "first"), event(2, "second")]);
        bytes.truncate(bytes.len() - 3);

        assert!(matches!(
            decode_objects(&mut codec, &bytes, false),
            Err(EncodingError::UnexpectedEof { .. })
        ));
    }
}
