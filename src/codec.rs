use std::io;

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use thiserror::Error as ThisError;
use tokio::io::AsyncRead;
use tokio_util::codec::Encoder;
use tracing::trace;

use crate::command::Command;
use crate::reply::Reply;
use crate::source::ByteSource;

/// Largest bulk string accepted from the server, the same default as Redis' `proto-max-bulk-len`.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Deepest array nesting accepted from the server. Every level is one more nested poll on the
/// stack, a reply nested deeper than this is rejected before it can exhaust it.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, ThisError)]
pub enum DecodeError {
    #[error("no data arrived within the read window")]
    TimedOut,
    #[error("protocol error; invalid reply data type: {0:#04x}")]
    InvalidDataType(u8),
    #[error("protocol error; invalid length {0:?}")]
    InvalidLength(String),
    #[error("protocol error; bulk string of {0} bytes exceeds limit")]
    TooLarge(i64),
    #[error("protocol error; missing line terminator")]
    MissingTerminator,
    #[error("protocol error; arrays nested deeper than {0} levels")]
    TooDeep(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DecodeError {
    /// Whether the peer closed the stream while a reply was being read.
    pub fn is_closed(&self) -> bool {
        matches!(self, DecodeError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Writes [`Command`]s in their RESP form, to be used with a `FramedWrite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandCodec;

impl Encoder<Command> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst);
        Ok(())
    }
}

/// Decodes exactly one reply from `src`, recursing into arrays.
///
/// Either the whole reply is produced or an error is returned, a failure in a nested element
/// fails the outer array. Whatever part of the reply was consumed before the failure is lost, so
/// the stream must not be trusted afterwards.
pub fn decode<'a, R>(src: &'a mut ByteSource<R>) -> BoxFuture<'a, Result<Reply, DecodeError>>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    decode_nested(src, 0)
}

// Boxed so arrays can recurse.
fn decode_nested<'a, R>(
    src: &'a mut ByteSource<R>,
    depth: usize,
) -> BoxFuture<'a, Result<Reply, DecodeError>>
where
    R: AsyncRead + Unpin + Send + 'a,
{
    decode_reply(src, depth).boxed()
}

async fn decode_reply<R>(src: &mut ByteSource<R>, depth: usize) -> Result<Reply, DecodeError>
where
    R: AsyncRead + Unpin + Send,
{
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep(MAX_DEPTH));
    }

    // The first byte in an RESP-serialized payload always identifies its type.
    let prefix = src.read_exact(1).await?.ok_or(DecodeError::TimedOut)?;

    match prefix[0] {
        b'-' => Ok(Reply::Error(read_text(src).await?)),
        b'+' => Ok(Reply::Status(read_text(src).await?)),
        b':' => Ok(Reply::Integer(read_text(src).await?)),
        // $<length>\r\n<data>\r\n
        b'$' => {
            let length = read_length(src).await?;
            if length == -1 {
                return Ok(Reply::Nil);
            }
            if length < -1 {
                return Err(DecodeError::InvalidLength(length.to_string()));
            }
            if length > MAX_BULK_LEN {
                return Err(DecodeError::TooLarge(length));
            }

            let mut data = src
                .read_exact(length as usize + 2)
                .await?
                .ok_or(DecodeError::TimedOut)?;
            if !data.ends_with(b"\r\n") {
                return Err(DecodeError::MissingTerminator);
            }
            data.truncate(length as usize);

            Ok(Reply::Bulk(data))
        }
        // *<number-of-elements>\r\n<element-1>...<element-n>
        b'*' => {
            let count = read_length(src).await?;
            if count <= 0 {
                return Ok(Reply::Array(Vec::new()));
            }

            let mut children = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                children.push(decode_nested(&mut *src, depth + 1).await?);
            }
            trace!(count, "decoded array reply");

            Ok(Reply::Array(children))
        }
        byte => Err(DecodeError::InvalidDataType(byte)),
    }
}

// Line without its terminator.
async fn read_line<R>(src: &mut ByteSource<R>) -> Result<Bytes, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut line = src.read_line().await?.ok_or(DecodeError::TimedOut)?;
    line.truncate(line.len() - 2);
    Ok(line)
}

async fn read_text<R>(src: &mut ByteSource<R>) -> Result<String, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let line = read_line(src).await?;
    Ok(String::from_utf8_lossy(&line).into_owned())
}

async fn read_length<R>(src: &mut ByteSource<R>) -> Result<i64, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let line = read_text(src).await?;
    line.parse::<i64>()
        .map_err(|_| DecodeError::InvalidLength(line))
}
