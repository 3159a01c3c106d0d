//! RouterOS API sentence codec.
//!
//! A sentence is a sequence of length-prefixed words closed by an empty
//! word. Word lengths use a one to five byte prefix whose leading bits
//! select the width.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ApiError, Record};

/// Longest word accepted from a router.
pub const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

/// One decoded reply sentence.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// `!re`: one result row.
    Record(Record),
    /// `!done`: the command finished; carries any trailing attributes.
    Done(Record),
    /// `!trap`: the command failed with the given message.
    Trap(String),
    /// `!fatal`: the router is closing the connection.
    Fatal(String),
    /// `!empty`: the command produced no rows (RouterOS 7.18 and later).
    Empty,
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "value is masked to a single byte before the cast"
)]
const fn byte_at(value: u32, shift: u32) -> u8 {
    ((value >> shift) & 0xFF) as u8
}

/// Encodes a word length prefix.
///
/// # Errors
///
/// Returns [`ApiError::Protocol`] when `len` does not fit in 32 bits.
pub fn encode_length(len: usize) -> Result<Vec<u8>, ApiError> {
    let value = u32::try_from(len)
        .map_err(|_| ApiError::Protocol(format!("word of {len} bytes is too long")))?;
    let prefix = match value {
        0..0x80 => vec![byte_at(value, 0)],
        0x80..0x4000 => {
            let tagged = value | 0x8000;
            vec![byte_at(tagged, 8), byte_at(tagged, 0)]
        }
        0x4000..0x20_0000 => {
            let tagged = value | 0xC0_0000;
            vec![byte_at(tagged, 16), byte_at(tagged, 8), byte_at(tagged, 0)]
        }
        0x20_0000..0x1000_0000 => {
            let tagged = value | 0xE000_0000;
            vec![
                byte_at(tagged, 24),
                byte_at(tagged, 16),
                byte_at(tagged, 8),
                byte_at(tagged, 0),
            ]
        }
        _ => vec![
            0xF0,
            byte_at(value, 24),
            byte_at(value, 16),
            byte_at(value, 8),
            byte_at(value, 0),
        ],
    };
    Ok(prefix)
}

/// Reads a word length prefix.
///
/// # Errors
///
/// Returns [`ApiError::Protocol`] for reserved control bytes and
/// [`ApiError::Io`] when the stream ends early.
pub async fn read_length<R>(reader: &mut R) -> Result<usize, ApiError>
where
    R: AsyncRead + Unpin,
{
    let first = reader.read_u8().await?;
    let (extra, mut value) = match first {
        0x00..=0x7F => (0, u32::from(first)),
        0x80..=0xBF => (1, u32::from(first & 0x3F)),
        0xC0..=0xDF => (2, u32::from(first & 0x1F)),
        0xE0..=0xEF => (3, u32::from(first & 0x0F)),
        0xF0 => (4, 0),
        other => {
            return Err(ApiError::Protocol(format!(
                "reserved length prefix 0x{other:02x}"
            )));
        }
    };
    for _ in 0..extra {
        value = (value << 8) | u32::from(reader.read_u8().await?);
    }
    usize::try_from(value)
        .map_err(|_| ApiError::Protocol(format!("word of {value} bytes is too long")))
}

/// Encodes a full sentence, including the terminating empty word.
///
/// # Errors
///
/// Returns [`ApiError::Protocol`] when a word is too long to encode.
pub fn encode_sentence<S: AsRef<str>>(words: &[S]) -> Result<Vec<u8>, ApiError> {
    let mut buf = Vec::new();
    for word in words {
        let bytes = word.as_ref().as_bytes();
        buf.extend(encode_length(bytes.len())?);
        buf.extend_from_slice(bytes);
    }
    buf.push(0);
    Ok(buf)
}

/// Writes a sentence and flushes the stream.
///
/// # Errors
///
/// Returns [`ApiError::Io`] on write failure.
pub async fn write_sentence<W, S>(writer: &mut W, words: &[S]) -> Result<(), ApiError>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    let buf = encode_sentence(words)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads words until the terminating empty word.
///
/// Non UTF-8 bytes are replaced rather than rejected; RouterOS stores
/// comments in whatever encoding the operator typed them.
///
/// # Errors
///
/// Returns [`ApiError::Io`] when the stream ends mid-sentence and
/// [`ApiError::Protocol`] for words longer than [`MAX_WORD_LEN`].
pub async fn read_sentence<R>(reader: &mut R) -> Result<Vec<String>, ApiError>
where
    R: AsyncRead + Unpin,
{
    let mut words = Vec::new();
    loop {
        let len = read_length(reader).await?;
        if len == 0 {
            return Ok(words);
        }
        if len > MAX_WORD_LEN {
            return Err(ApiError::Protocol(format!(
                "word of {len} bytes exceeds the {MAX_WORD_LEN} byte limit"
            )));
        }
        let mut buf = vec![0; len];
        reader.read_exact(&mut buf).await?;
        words.push(String::from_utf8_lossy(&buf).into_owned());
    }
}

/// Classifies a reply sentence.
///
/// # Errors
///
/// Returns [`ApiError::Protocol`] for empty sentences and unknown reply
/// words.
pub fn parse_reply(words: Vec<String>) -> Result<Reply, ApiError> {
    let mut iter = words.into_iter();
    let Some(kind) = iter.next() else {
        return Err(ApiError::Protocol(String::from("empty reply sentence")));
    };

    let mut attributes = Record::new();
    let mut bare = Vec::new();
    for word in iter {
        if let Some(rest) = word.strip_prefix('=') {
            let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
            attributes.insert(key.to_owned(), value.to_owned());
        } else if !word.starts_with(".tag=") {
            bare.push(word);
        }
    }

    match kind.as_str() {
        "!re" => Ok(Reply::Record(attributes)),
        "!done" => Ok(Reply::Done(attributes)),
        "!empty" => Ok(Reply::Empty),
        "!trap" => Ok(Reply::Trap(
            attributes
                .remove("message")
                .unwrap_or_else(|| String::from("unspecified error")),
        )),
        "!fatal" => Ok(Reply::Fatal(
            attributes
                .remove("message")
                .unwrap_or_else(|| bare.join(" ")),
        )),
        other => Err(ApiError::Protocol(format!("unexpected reply `{other}`"))),
    }
}
