//! Newline-delimited packet framing

use crate::{Packet, ProtocolError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum packet size (10MB)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Read one `\n`-terminated line without buffering past it
///
/// Returns `None` on EOF before any byte was read.
pub async fn read_line_unbuffered<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if reader.read(&mut byte).await? == 0 {
            return if line.is_empty() {
                Ok(None)
            } else {
                Err(ProtocolError::ConnectionClosed)
            };
        }

        line.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(Some(line));
        }
        if line.len() > max_size {
            return Err(ProtocolError::PacketSizeExceeded(line.len(), max_size));
        }
    }
}

/// Serialize and write one packet, then flush
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = packet.to_bytes()?;
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(ProtocolError::PacketSizeExceeded(bytes.len(), MAX_PACKET_SIZE));
    }

    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Buffered packet reader for an established session
pub struct PacketReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    /// Next packet, or `None` on a clean EOF
    ///
    /// Blank lines are skipped.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            self.buf.clear();
            let limit = (MAX_PACKET_SIZE + 1) as u64;
            let read = (&mut self.inner).take(limit).read_until(b'\n', &mut self.buf).await?;

            if read == 0 {
                return Ok(None);
            }
            if self.buf.len() > MAX_PACKET_SIZE {
                return Err(ProtocolError::PacketSizeExceeded(self.buf.len(), MAX_PACKET_SIZE));
            }
            if self.buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Packet::from_bytes(&self.buf).map(Some);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ping::PingBody;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_unbuffered_read_stops_at_newline() {
        let data: &[u8] = b"{\"id\":1}\nTLS";
        let mut reader = data;

        let line = read_line_unbuffered(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(line, b"{\"id\":1}\n");
        assert_eq!(reader, b"TLS");
    }

    #[tokio::test]
    async fn test_unbuffered_read_across_segments() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"{\"id\"")
            .read(b":1,\"type\"")
            .read(b":\"kdeconnect.ping\"}\n")
            .build();

        let line = read_line_unbuffered(&mut reader, 1024).await.unwrap().unwrap();
        assert!(Packet::from_bytes(&line).unwrap().is_type("kdeconnect.ping"));
    }

    #[tokio::test]
    async fn test_write_packet_is_one_line() {
        let packet = Packet::from_body(&PingBody::default()).unwrap().with_id(5);
        let mut writer = tokio_test::io::Builder::new()
            .write(b"{\"id\":5,\"type\":\"kdeconnect.ping\",\"body\":{}}\n")
            .build();

        write_packet(&mut writer, &packet).await.unwrap();
    }

    #[tokio::test]
    async fn test_unbuffered_read_eof() {
        let mut empty: &[u8] = b"";
        assert!(read_line_unbuffered(&mut empty, 1024).await.unwrap().is_none());

        let mut partial: &[u8] = b"{\"id\"";
        assert!(matches!(
            read_line_unbuffered(&mut partial, 1024).await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unbuffered_read_limit() {
        let mut long: &[u8] = &[b'a'; 64];
        assert!(matches!(
            read_line_unbuffered(&mut long, 16).await,
            Err(ProtocolError::PacketSizeExceeded(..))
        ));
    }

    #[tokio::test]
    async fn test_reader_and_writer() {
        let (mut client, server) = duplex(4096);
        let mut reader = PacketReader::new(server);

        let first = Packet::from_body(&PingBody::with_message("one")).unwrap();
        let second = Packet::from_body(&PingBody::default()).unwrap();
        write_packet(&mut client, &first).await.unwrap();
        client.write_all(b"\n").await.unwrap();
        write_packet(&mut client, &second).await.unwrap();
        drop(client);

        assert_eq!(reader.next_packet().await.unwrap(), Some(first));
        assert_eq!(reader.next_packet().await.unwrap(), Some(second));
        assert_eq!(reader.next_packet().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_rejects_garbage() {
        let data: &[u8] = b"this is not json\n";
        let mut reader = PacketReader::new(data);
        assert!(matches!(
            reader.next_packet().await,
            Err(ProtocolError::InvalidPacket(_))
        ));
    }
}
