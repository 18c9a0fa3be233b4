//! Encoder for host commands and decoder for device responses.
//!
//! All multi-byte integers are little-endian, matching the controller's
//! firmware. `char` fields are single bytes.

use crate::error::ProtocolError;
use crate::header::Header;
use crate::transport::Transport;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encodes host commands into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a command that consists of its header byte only.
    pub fn command(header: Header) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1);
        buf.put_u8(header.as_byte());
        buf
    }

    /// Encodes `['E'] + mask`.
    pub fn enable_ports(inputs_enabled: &[bool]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + inputs_enabled.len());
        buf.put_u8(Header::EnablePorts.as_byte());
        for enabled in inputs_enabled {
            buf.put_u8(u8::from(*enabled));
        }
        buf
    }

    /// Encodes `['K', sync_channel, sync_mode]`.
    pub fn sync_channel_mode(sync_channel: u8, sync_mode: u8) -> BytesMut {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(Header::SyncChannelMode.as_byte());
        buf.put_u8(sync_channel);
        buf.put_u8(sync_mode);
        buf
    }

    /// Encodes `['C'] + table8` followed by the 32-bit table.
    pub fn new_state_matrix(table8: &[u8], table32: &[u32]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + table8.len() + 4 * table32.len());
        buf.put_u8(Header::NewStateMatrix.as_byte());
        buf.put_slice(table8);
        for value in table32 {
            buf.put_u32_le(*value);
        }
        buf
    }

    /// Encodes a single serial message for `channel` (numbered from 1).
    pub fn load_serial_message(
        channel: u8,
        message_id: u8,
        message: &[u8],
    ) -> Result<BytesMut, ProtocolError> {
        Self::load_serial_messages(channel, &[(message_id, message)])
    }

    /// Encodes `['L', channel-1, n_messages]` then `[id, len] + bytes` per message.
    pub fn load_serial_messages(
        channel: u8,
        messages: &[(u8, &[u8])],
    ) -> Result<BytesMut, ProtocolError> {
        if channel == 0 {
            return Err(ProtocolError::InvalidChannel(channel));
        }
        let n_messages = u8::try_from(messages.len()).map_err(|_| ProtocolError::PayloadTooLarge {
            what: "serial message count",
            len: messages.len(),
            max: u8::MAX as usize,
        })?;

        let body: usize = messages.iter().map(|(_, m)| 2 + m.len()).sum();
        let mut buf = BytesMut::with_capacity(3 + body);
        buf.put_u8(Header::LoadSerialMessage.as_byte());
        buf.put_u8(channel - 1);
        buf.put_u8(n_messages);
        for (message_id, message) in messages {
            let len = u8::try_from(message.len()).map_err(|_| ProtocolError::PayloadTooLarge {
                what: "serial message",
                len: message.len(),
                max: u8::MAX as usize,
            })?;
            buf.put_u8(*message_id);
            buf.put_u8(len);
            buf.put_slice(message);
        }
        Ok(buf)
    }

    /// Encodes `['O', channel, value]`.
    pub fn override_digital_hw_state(channel: u8, value: u8) -> BytesMut {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(Header::OverrideDigitalHwState.as_byte());
        buf.put_u8(channel);
        buf.put_u8(value);
        buf
    }

    /// Encodes `['U', channel, byte]`.
    pub fn send_to_hw_serial(channel: u8, byte: u8) -> BytesMut {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u8(Header::SendToHwSerial.as_byte());
        buf.put_u8(channel);
        buf.put_u8(byte);
        buf
    }
}

/// Reads fixed-width values from a transport.
///
/// Every read is exact: a transport that returns fewer bytes than asked
/// for yields [`ProtocolError::Underrun`].
pub struct Decoder<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: Transport + ?Sized> Decoder<'a, T> {
    pub fn new(transport: &'a mut T) -> Self {
        Self { transport }
    }

    /// Reads exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<Bytes, ProtocolError> {
        let bytes = self.transport.read_bytes(n)?;
        if bytes.len() < n {
            tracing::debug!("underrun: wanted {} bytes, got {}", n, bytes.len());
            return Err(ProtocolError::Underrun {
                expected: n,
                received: bytes.len(),
            });
        }
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.read_exact(1)?.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(self.read_exact(2)?.get_u16_le())
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(self.read_exact(4)?.get_u32_le())
    }

    /// Reads `n` single-byte characters.
    pub fn read_chars(&mut self, n: usize) -> Result<Vec<char>, ProtocolError> {
        Ok(self.read_exact(n)?.iter().map(|b| *b as char).collect())
    }

    pub fn read_u8_array(&mut self, n: usize) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.read_exact(n)?.to_vec())
    }

    pub fn read_u32_array(&mut self, n: usize) -> Result<Vec<u32>, ProtocolError> {
        let mut bytes = self.read_exact(n * 4)?;
        let mut values = Vec::with_capacity(n);
        while bytes.has_remaining() {
            values.push(bytes.get_u32_le());
        }
        Ok(values)
    }

    /// Reads a runtime `(opcode, data)` frame.
    pub fn read_frame(&mut self) -> Result<(u8, u8), ProtocolError> {
        let mut bytes = self.read_exact(2)?;
        Ok((bytes.get_u8(), bytes.get_u8()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use proptest::prelude::*;

    #[test]
    fn test_encode_simple_commands() {
        assert_eq!(&Encoder::command(Header::Handshake)[..], b"6");
        assert_eq!(&Encoder::command(Header::RunStateMachine)[..], b"R");
        assert_eq!(
            &Encoder::sync_channel_mode(255, 1)[..],
            &[b'K', 255, 1]
        );
        assert_eq!(
            &Encoder::override_digital_hw_state(4, 255)[..],
            &[b'O', 4, 255]
        );
        assert_eq!(&Encoder::send_to_hw_serial(1, 65)[..], &[b'U', 1, 65]);
    }

    #[test]
    fn test_encode_enable_ports() {
        let buf = Encoder::enable_ports(&[false, true, true, false]);
        assert_eq!(&buf[..], &[b'E', 0, 1, 1, 0]);
    }

    #[test]
    fn test_encode_new_state_matrix_is_little_endian() {
        let buf = Encoder::new_state_matrix(&[1, 0], &[1000, 0x0102_0304]);
        assert_eq!(
            &buf[..],
            &[b'C', 1, 0, 0xE8, 0x03, 0, 0, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_encode_serial_message() {
        let buf = Encoder::load_serial_message(2, 5, &[10, 20, 30]).unwrap();
        assert_eq!(&buf[..], &[b'L', 1, 1, 5, 3, 10, 20, 30]);
    }

    #[test]
    fn test_encode_serial_message_rejects_bad_input() {
        assert!(matches!(
            Encoder::load_serial_message(0, 1, &[1]),
            Err(ProtocolError::InvalidChannel(0))
        ));

        let long = vec![0u8; 256];
        assert!(matches!(
            Encoder::load_serial_message(1, 1, &long),
            Err(ProtocolError::PayloadTooLarge { len: 256, .. })
        ));
    }

    #[test]
    fn test_decode_typed_values() {
        let mut transport = MemoryTransport::with_incoming(&[
            7, // u8
            0x16, 0x00, // u16 = 22
            0x10, 0x27, 0x00, 0x00, // u32 = 10000
            b'U', b'P', // chars
        ]);
        let mut decoder = Decoder::new(&mut transport);
        assert_eq!(decoder.read_u8().unwrap(), 7);
        assert_eq!(decoder.read_u16().unwrap(), 22);
        assert_eq!(decoder.read_u32().unwrap(), 10_000);
        assert_eq!(decoder.read_chars(2).unwrap(), vec!['U', 'P']);
    }

    #[test]
    fn test_decode_frame() {
        let mut transport = MemoryTransport::with_incoming(&[1, 3]);
        let mut decoder = Decoder::new(&mut transport);
        assert_eq!(decoder.read_frame().unwrap(), (1, 3));
    }

    #[test]
    fn test_decode_underrun() {
        let mut transport = MemoryTransport::with_incoming(&[0x01, 0x02]);
        let mut decoder = Decoder::new(&mut transport);
        let err = decoder.read_u32().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Underrun {
                expected: 4,
                received: 2
            }
        ));
    }

    proptest! {
        #[test]
        fn prop_u32_array_decodes_little_endian(values in proptest::collection::vec(any::<u32>(), 0..64)) {
            let mut wire = Vec::new();
            for v in &values {
                wire.extend_from_slice(&v.to_le_bytes());
            }
            let mut transport = MemoryTransport::with_incoming(&wire);
            let mut decoder = Decoder::new(&mut transport);
            prop_assert_eq!(decoder.read_u32_array(values.len()).unwrap(), values);
        }
    }
}
