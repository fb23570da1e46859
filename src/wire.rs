use crate::error::CommError;
use std::io::Write;

//====================================================================================
//            CommHeader
//====================================================================================

/// Encoded header length in bytes. `header_len` on the wire always equals this for
/// messages produced by this crate; peers may extend the header, receivers skip to
/// `header_len` to find the payload.
pub const COMM_HEADER_LEN: usize = 28;
pub const COMM_VERSION: u8 = 1;

/// Message is a request expecting to be routed to a server-side handler.
pub const FLAG_REQUEST: u16 = 0x01;
/// Sender does not want a response even though an id is present.
pub const FLAG_IGNORE_RESPONSE: u16 = 0x02;

/// Fixed wire header preceding every message, TCP and UDP alike.
/// `id == 0` means no response is expected; every other id is unique while the
/// request is outstanding. `total_len` covers header and payload.
/// All fields are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommHeader {
    pub version: u8,
    pub header_len: u8,
    pub flags: u16,
    pub command: u32,
    pub group_id: u32,
    pub id: u32,
    pub timeout_ms: u32,
    pub total_len: u32,
    pub checksum: u32, // payload checksum, 0 = absent
}

impl Default for CommHeader {
    fn default() -> Self {
        Self {
            version: COMM_VERSION,
            header_len: COMM_HEADER_LEN as u8,
            flags: 0,
            command: 0,
            group_id: 0,
            id: 0,
            timeout_ms: 0,
            total_len: COMM_HEADER_LEN as u32,
            checksum: 0,
        }
    }
}

impl CommHeader {
    pub fn new_request(command: u32, group_id: u32) -> Self {
        Self {
            flags: FLAG_REQUEST,
            command,
            group_id,
            ..Default::default()
        }
    }

    pub fn is_request(&self) -> bool {
        self.flags & FLAG_REQUEST != 0
    }
    pub fn ignore_response(&self) -> bool {
        self.flags & FLAG_IGNORE_RESPONSE != 0
    }
    /// A response is expected iff an id was assigned and the sender didn't opt out.
    pub fn expects_response(&self) -> bool {
        self.id != 0 && !self.ignore_response()
    }
    pub fn payload_len(&self) -> usize {
        (self.total_len as usize).saturating_sub(self.header_len as usize)
    }

    pub fn encode(&self) -> [u8; COMM_HEADER_LEN] {
        let mut buf = [0u8; COMM_HEADER_LEN];
        buf[0] = self.version;
        buf[1] = self.header_len;
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.command.to_le_bytes());
        buf[8..12].copy_from_slice(&self.group_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.timeout_ms.to_le_bytes());
        buf[20..24].copy_from_slice(&self.total_len.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CommError> {
        if buf.len() < COMM_HEADER_LEN {
            return Err(CommError::BadHeader("truncated header"));
        }
        let header = Self {
            version: buf[0],
            header_len: buf[1],
            flags: u16::from_le_bytes([buf[2], buf[3]]),
            command: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            group_id: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            id: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
            timeout_ms: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            total_len: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            checksum: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
        };
        if header.version != COMM_VERSION {
            return Err(CommError::BadHeader("unsupported version"));
        }
        if (header.header_len as usize) < COMM_HEADER_LEN {
            return Err(CommError::BadHeader("header_len too small"));
        }
        if header.total_len < header.header_len as u32 {
            return Err(CommError::BadHeader("total_len < header_len"));
        }
        Ok(header)
    }

    /// Decode one datagram: byte 1 carries `header_len`, which locates the payload
    /// boundary; the datagram boundary itself delimits the payload.
    pub fn decode_datagram(buf: &[u8]) -> Result<(Self, &[u8]), CommError> {
        let header = Self::decode(buf)?;
        let hlen = header.header_len as usize;
        if buf.len() < hlen {
            return Err(CommError::BadHeader("datagram shorter than header_len"));
        }
        Ok((header, &buf[hlen..]))
    }
}

/// Fletcher-32 over the payload bytes. Stored in `checksum` when the sender opts in.
pub fn fletcher32(data: &[u8]) -> u32 {
    let (mut sum1, mut sum2) = (0xffffu32, 0xffffu32);
    for chunk in data.chunks(360) {
        for &b in chunk {
            sum1 += b as u32;
            sum2 += sum1;
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }
    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    (sum2 << 16) | sum1
}

//====================================================================================
//            CommBuf
//====================================================================================

/// An outbound message: encoded header, payload, and an optional extension segment
/// appended without copy for large payloads. Once enqueued on a send queue the only
/// mutation is cursor advancement on partial writes.
pub struct CommBuf {
    pub header: CommHeader,
    payload: Vec<u8>,
    ext: Vec<u8>,
    encoded: [u8; COMM_HEADER_LEN],
    cursor: usize,
    frozen: bool,
}

impl CommBuf {
    pub fn new(header: CommHeader, payload: Vec<u8>) -> Self {
        Self {
            header,
            payload,
            ext: Vec::new(),
            encoded: [0u8; COMM_HEADER_LEN],
            cursor: 0,
            frozen: false,
        }
    }

    /// Build a response carrying the request's id, command and group so the
    /// requester's correlation logic can route it.
    pub fn response_for(request: &CommHeader, payload: Vec<u8>) -> Self {
        let mut header = CommHeader::default();
        header.command = request.command;
        header.group_id = request.group_id;
        header.id = request.id;
        Self::new(header, payload)
    }

    /// Attach a secondary buffer appended after the payload without copying.
    pub fn with_ext(header: CommHeader, payload: Vec<u8>, ext: Vec<u8>) -> Self {
        let mut buf = Self::new(header, payload);
        buf.ext = ext;
        buf
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len() + self.ext.len()
    }

    /// Compute checksum over payload + ext and record it in the header.
    pub fn sign(&mut self) {
        debug_assert!(!self.frozen);
        let mut sum = fletcher32(&self.payload);
        if !self.ext.is_empty() {
            let mut all = self.payload.clone();
            all.extend_from_slice(&self.ext);
            sum = fletcher32(&all);
        }
        self.header.checksum = sum;
    }

    /// Finalize `total_len` and encode the header. Called by the send path after
    /// stamping id/flags/timeout; the buffer must not be mutated afterwards.
    pub(crate) fn freeze(&mut self) {
        self.header.total_len = (COMM_HEADER_LEN + self.payload_len()) as u32;
        self.encoded = self.header.encode();
        self.frozen = true;
    }

    pub(crate) fn total_size(&self) -> usize {
        COMM_HEADER_LEN + self.payload_len()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.cursor >= self.total_size()
    }

    /// First unwritten segment in wire order: header bytes, payload, then ext.
    fn current_segment(&self) -> &[u8] {
        let mut pos = self.cursor;
        if pos < COMM_HEADER_LEN {
            return &self.encoded[pos..];
        }
        pos -= COMM_HEADER_LEN;
        if pos < self.payload.len() {
            return &self.payload[pos..];
        }
        pos -= self.payload.len();
        if pos < self.ext.len() {
            return &self.ext[pos..];
        }
        &[]
    }

    /// Write remaining bytes to `sock`, advancing the cursor. Returns true when the
    /// whole buffer has been sent. A short write returns Ok(false); WouldBlock and
    /// other errors are propagated for the caller to classify.
    pub(crate) fn write_to(&mut self, sock: &mut impl Write) -> std::io::Result<bool> {
        debug_assert!(self.frozen);
        while !self.is_done() {
            let (n, seg_len) = {
                let seg = self.current_segment();
                if seg.is_empty() {
                    break;
                }
                (sock.write(seg)?, seg.len())
            };
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "wrote 0 bytes",
                ));
            }
            self.cursor += n;
            if n < seg_len {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Contiguous wire bytes; datagrams are sent whole.
    pub(crate) fn to_datagram(&self) -> Vec<u8> {
        debug_assert!(self.frozen);
        let mut out = Vec::with_capacity(self.total_size());
        out.extend_from_slice(&self.encoded);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.ext);
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_header_roundtrip() {
        let mut header = CommHeader::new_request(0x1234, 7);
        header.id = 42;
        header.timeout_ms = 1500;
        header.total_len = COMM_HEADER_LEN as u32 + 10;
        header.checksum = fletcher32(b"0123456789");
        let bytes = header.encode();
        let decoded = CommHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_request());
        assert!(decoded.expects_response());
        assert_eq!(decoded.payload_len(), 10);
    }

    #[test]
    pub fn test_header_rejects_garbage() {
        assert!(CommHeader::decode(&[0u8; 4]).is_err());
        let mut bytes = CommHeader::default().encode();
        bytes[0] = 99; // bad version
        assert!(CommHeader::decode(&bytes).is_err());
        let mut bytes = CommHeader::default().encode();
        bytes[1] = 4; // header_len too small
        assert!(CommHeader::decode(&bytes).is_err());
    }

    #[test]
    pub fn test_response_suppression() {
        let mut header = CommHeader::new_request(1, 0);
        assert!(!header.expects_response()); // id not yet assigned
        header.id = 9;
        assert!(header.expects_response());
        header.flags |= FLAG_IGNORE_RESPONSE;
        assert!(!header.expects_response());
    }

    #[test]
    pub fn test_datagram_decode() {
        let mut buf = CommBuf::new(CommHeader::new_request(5, 0), b"ten bytes!".to_vec());
        buf.freeze();
        let wire = buf.to_datagram();
        let (header, payload) = CommHeader::decode_datagram(&wire).unwrap();
        assert_eq!(header.command, 5);
        assert_eq!(payload, b"ten bytes!");
    }

    /// Writer that accepts at most `cap` bytes per call, to exercise cursor advancement.
    struct Throttled {
        out: Vec<u8>,
        cap: usize,
    }
    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = buf.len().min(self.cap);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    pub fn test_partial_writes_preserve_stream() {
        let mut buf = CommBuf::with_ext(
            CommHeader::new_request(2, 0),
            b"primary".to_vec(),
            b"extension-bytes".to_vec(),
        );
        buf.freeze();
        let expect = buf.to_datagram();
        let mut sink = Throttled {
            out: Vec::new(),
            cap: 3,
        };
        let mut rounds = 0;
        while !buf.write_to(&mut sink).unwrap() {
            rounds += 1;
            assert!(rounds < 100);
        }
        assert_eq!(sink.out, expect);
        assert!(buf.is_done());
    }
}
