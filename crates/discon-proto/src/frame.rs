use std::fmt;

use crate::staging::cstr_str;

/// Index in the swap array holding the capacity of the message buffer.
pub const SWAP_MSG_LEN: usize = 48;
/// Index in the swap array holding the capacity of the input-file buffer.
pub const SWAP_INFILE_LEN: usize = 49;
/// Index in the swap array holding the capacity of the output-name buffer.
pub const SWAP_OUTNAME_LEN: usize = 63;
/// Index in the swap array holding the length of the swap array itself.
pub const SWAP_SWAP_LEN: usize = 128;

/// Capacity reserved for the status message in a file-transfer response.
const TRANSFER_MSG_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEof,
}

/// One request or response record on the wire.
///
/// The swap array, fail flag and the three character buffers mirror the
/// controller ABI's mutable arguments; `file_content` and `server_file_path`
/// carry the file-staging side channel and are both empty on ABI calls.
///
/// Encoding is a fixed header of six little-endian `u32` counts (`swap`,
/// `in_file`, `out_name`, `msg`, `file_content`, `server_file_path`) followed
/// by the swap floats, `fail` as a little-endian `i32`, and the five byte
/// buffers in header order with no padding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub swap: Vec<f32>,
    pub fail: i32,
    pub in_file: Vec<u8>,
    pub out_name: Vec<u8>,
    pub msg: Vec<u8>,
    pub file_content: Vec<u8>,
    pub server_file_path: Vec<u8>,
}

impl Frame {
    /// A frame is a file-staging request iff both side-channel buffers are
    /// non-empty. Anything else is an ABI call.
    pub fn is_file_transfer(&self) -> bool {
        !self.file_content.is_empty() && !self.server_file_path.is_empty()
    }

    /// Builds a file-staging request carrying `content` to be written at
    /// `server_path` on the remote side. The ABI buffers are placeholders.
    pub fn file_transfer(content: Vec<u8>, server_path: &str) -> Self {
        let mut path = server_path.as_bytes().to_vec();
        path.push(0);
        Frame {
            swap: vec![0.0],
            fail: 0,
            in_file: vec![0],
            out_name: vec![0],
            msg: vec![0],
            file_content: content,
            server_file_path: path,
        }
    }

    /// Builds the response to a file-staging request: `fail` 0/1 and a
    /// NUL-terminated status message.
    pub fn transfer_response(success: bool, message: &str) -> Self {
        let mut msg = vec![0u8; TRANSFER_MSG_CAPACITY];
        let bytes = message.as_bytes();
        let n = bytes.len().min(TRANSFER_MSG_CAPACITY - 1);
        msg[..n].copy_from_slice(&bytes[..n]);
        Frame {
            swap: vec![0.0],
            fail: if success { 0 } else { 1 },
            in_file: vec![0],
            out_name: vec![0],
            msg,
            file_content: Vec::new(),
            server_file_path: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Serializes the frame into `out`, clearing it first. Reusing one buffer
    /// across a session avoids reallocating per exchange.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(24 + self.swap.len() * 4 + 4 + self.byte_len());
        for len in [
            self.swap.len(),
            self.in_file.len(),
            self.out_name.len(),
            self.msg.len(),
            self.file_content.len(),
            self.server_file_path.len(),
        ] {
            out.extend_from_slice(&(len as u32).to_le_bytes());
        }
        for v in &self.swap {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&self.fail.to_le_bytes());
        out.extend_from_slice(&self.in_file);
        out.extend_from_slice(&self.out_name);
        out.extend_from_slice(&self.msg);
        out.extend_from_slice(&self.file_content);
        out.extend_from_slice(&self.server_file_path);
    }

    pub fn decode(data: &[u8]) -> Result<Frame, WireError> {
        let mut frame = Frame::default();
        frame.decode_into(data)?;
        Ok(frame)
    }

    /// Deserializes `data` into `self`. The header counts are the only
    /// framing; buffers are resized only when the incoming count differs from
    /// the current allocation so a long-lived frame keeps its storage.
    pub fn decode_into(&mut self, data: &[u8]) -> Result<(), WireError> {
        let mut r = Reader { data, pos: 0 };
        let swap_len = r.read_u32()? as usize;
        let in_file_len = r.read_u32()? as usize;
        let out_name_len = r.read_u32()? as usize;
        let msg_len = r.read_u32()? as usize;
        let file_content_len = r.read_u32()? as usize;
        let server_file_path_len = r.read_u32()? as usize;

        // Validate the body length before touching any allocation.
        let body = swap_len
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .and_then(|n| n.checked_add(in_file_len))
            .and_then(|n| n.checked_add(out_name_len))
            .and_then(|n| n.checked_add(msg_len))
            .and_then(|n| n.checked_add(file_content_len))
            .and_then(|n| n.checked_add(server_file_path_len))
            .ok_or(WireError::UnexpectedEof)?;
        if r.remaining() < body {
            return Err(WireError::UnexpectedEof);
        }

        if self.swap.len() != swap_len {
            self.swap.resize(swap_len, 0.0);
        }
        for v in self.swap.iter_mut() {
            *v = f32::from_le_bytes(r.take_array()?);
        }
        self.fail = i32::from_le_bytes(r.take_array()?);
        r.take_into(&mut self.in_file, in_file_len)?;
        r.take_into(&mut self.out_name, out_name_len)?;
        r.take_into(&mut self.msg, msg_len)?;
        r.take_into(&mut self.file_content, file_content_len)?;
        r.take_into(&mut self.server_file_path, server_file_path_len)?;
        Ok(())
    }

    fn byte_len(&self) -> usize {
        self.in_file.len()
            + self.out_name.len()
            + self.msg.len()
            + self.file_content.len()
            + self.server_file_path.len()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "swap[{}] fail={} in_file='{}' out_name='{}' msg='{}' staged_path='{}' content={}B",
            self.swap.len(),
            self.fail,
            cstr_str(&self.in_file),
            cstr_str(&self.out_name),
            cstr_str(&self.msg),
            cstr_str(&self.server_file_path),
            self.file_content.len(),
        )
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        if self.remaining() < N {
            return Err(WireError::UnexpectedEof);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn take_into(&mut self, buf: &mut Vec<u8>, len: usize) -> Result<(), WireError> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof);
        }
        if buf.len() != len {
            buf.resize(len, 0);
        }
        buf.copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abi_frame() -> Frame {
        let mut frame = Frame {
            swap: vec![0.0; 130],
            fail: 1,
            in_file: b"input.txt\0".to_vec(),
            out_name: b"output.txt\0".to_vec(),
            msg: vec![0u8; 21],
            file_content: Vec::new(),
            server_file_path: Vec::new(),
        };
        frame.swap[SWAP_MSG_LEN] = frame.msg.len() as f32;
        frame.swap[SWAP_INFILE_LEN] = frame.in_file.len() as f32;
        frame.swap[SWAP_OUTNAME_LEN] = frame.out_name.len() as f32;
        frame.swap[SWAP_SWAP_LEN] = frame.swap.len() as f32;
        frame
    }

    #[test]
    fn encode_decode_abi_frame() {
        let frame = abi_frame();
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).expect("decode");
        assert_eq!(frame, decoded);
        assert_eq!(encoded, decoded.encode());
    }

    #[test]
    fn encode_decode_empty_frame() {
        let frame = Frame::default();
        let encoded = frame.encode();
        assert_eq!(encoded.len(), 24 + 4);
        let decoded = Frame::decode(&encoded).expect("decode");
        assert_eq!(frame, decoded);
        assert_eq!(encoded, decoded.encode());
    }

    #[test]
    fn decode_reuses_allocations() {
        let frame = abi_frame();
        let encoded = frame.encode();
        let mut target = abi_frame();
        let swap_ptr = target.swap.as_ptr();
        let msg_ptr = target.msg.as_ptr();
        target.decode_into(&encoded).expect("decode");
        assert_eq!(target, frame);
        assert_eq!(target.swap.as_ptr(), swap_ptr);
        assert_eq!(target.msg.as_ptr(), msg_ptr);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let encoded = abi_frame().encode();
        assert_eq!(
            Frame::decode(&encoded[..encoded.len() - 1]),
            Err(WireError::UnexpectedEof)
        );
        assert_eq!(Frame::decode(&encoded[..10]), Err(WireError::UnexpectedEof));
    }

    #[test]
    fn file_transfer_requires_both_buffers() {
        let staged = Frame::file_transfer(b"x".to_vec(), "input_deadbeef_servo.cfg");
        assert!(staged.is_file_transfer());

        // One-sided frames are ABI calls.
        let mut half = staged.clone();
        half.file_content.clear();
        assert!(!half.is_file_transfer());
        let mut half = staged;
        half.server_file_path.clear();
        assert!(!half.is_file_transfer());
        assert!(!abi_frame().is_file_transfer());
    }

    #[test]
    fn transfer_response_carries_status() {
        let ok = Frame::transfer_response(true, "File transferred successfully: a.txt");
        assert_eq!(ok.fail, 0);
        assert_eq!(ok.msg.len(), 256);
        assert_eq!(
            cstr_str(&ok.msg),
            "File transferred successfully: a.txt"
        );

        let err = Frame::transfer_response(false, "Security error: bad path");
        assert_eq!(err.fail, 1);
        assert!(cstr_str(&err.msg).starts_with("Security error:"));
        assert!(!err.is_file_transfer());
    }

    #[test]
    fn transfer_response_truncates_long_messages() {
        let long = "x".repeat(400);
        let frame = Frame::transfer_response(false, &long);
        assert_eq!(frame.msg.len(), 256);
        assert_eq!(frame.msg[255], 0);
        assert_eq!(cstr_str(&frame.msg).len(), 255);
    }
}
