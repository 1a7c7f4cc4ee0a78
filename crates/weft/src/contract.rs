//! Collaborator contracts consumed by code built on top of the scheduler.

/// A value with a binary wire representation, handed between actors and
/// storage layers. The scheduler never interprets the bytes.
pub trait BinaryValue: Send {
    /// Replaces the value with one decoded from `buffer`. Returns false
    /// when the buffer does not hold a complete value.
    fn wrap(&mut self, buffer: &[u8]) -> bool;

    /// Appends the encoded representation to `out`.
    fn write(&self, out: &mut Vec<u8>);

    /// Encoded length in bytes.
    fn length(&self) -> usize;
}

/// A closure handed to the blocking pool.
pub type BlockingAction = Box<dyn FnOnce() + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, PartialEq, Debug)]
    struct LengthPrefixed {
        data: Vec<u8>,
    }

    impl BinaryValue for LengthPrefixed {
        fn wrap(&mut self, buffer: &[u8]) -> bool {
            if buffer.len() < 4 {
                return false;
            }
            let len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
            if buffer.len() < 4 + len {
                return false;
            }
            self.data = buffer[4..4 + len].to_vec();
            true
        }

        fn write(&self, out: &mut Vec<u8>) {
            out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.data);
        }

        fn length(&self) -> usize {
            4 + self.data.len()
        }
    }

    #[test]
    fn test_wrap_rejects_short_buffer() {
        let mut value = LengthPrefixed::default();
        assert!(!value.wrap(&[1, 0]));
        assert!(!value.wrap(&[5, 0, 0, 0, 1, 2]));

        let mut out = Vec::new();
        LengthPrefixed {
            data: vec![9, 8, 7],
        }
        .write(&mut out);
        assert!(value.wrap(&out));
        assert_eq!(value.data, vec![9, 8, 7]);
        assert_eq!(value.length(), out.len());
    }
}
