use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;

static CRLF: &[u8; 2] = b"\r\n";

/// A command as sent to the server: the command name followed by its arguments, each one an
/// arbitrary byte string.
///
/// ```
/// use resplink::command::Command;
///
/// let cmd = Command::new("SET").arg("a").arg("b");
/// assert_eq!(&cmd.to_bytes()[..], b"*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    parts: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl AsRef<[u8]>) -> Command {
        Command {
            parts: vec![Bytes::copy_from_slice(name.as_ref())],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Command {
        self.parts.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        self.parts
            .extend(args.into_iter().map(|a| Bytes::copy_from_slice(a.as_ref())));
        self
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.parts[0]).into_owned()
    }

    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Appends the RESP form of the command to `dst`:
    /// `*<count>\r\n` followed by `$<len>\r\n<bytes>\r\n` per part.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());

        dst.put_u8(b'*');
        dst.extend_from_slice(self.parts.len().to_string().as_bytes());
        dst.extend_from_slice(CRLF);

        for part in &self.parts {
            dst.put_u8(b'$');
            dst.extend_from_slice(part.len().to_string().as_bytes());
            dst.extend_from_slice(CRLF);
            dst.extend_from_slice(part);
            dst.extend_from_slice(CRLF);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode(&mut dst);
        dst.freeze()
    }

    // Upper bound, length prefixes are counted as if they had 20 digits.
    fn encoded_len(&self) -> usize {
        let headers = (self.parts.len() + 1) * (1 + 20 + CRLF.len());
        let payload: usize = self.parts.iter().map(|p| p.len() + CRLF.len()).sum();
        headers + payload
    }
}

// Logged with every command, so payloads are shown lossily on a single line.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.parts
                .iter()
                .map(|p| String::from_utf8_lossy(p))
                .join(" ")
        )
    }
}
