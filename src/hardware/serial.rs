// src/hardware/serial.rs - Byte-stream links the command interpreter reads from
use async_trait::async_trait;
use serial2_tokio::SerialPort;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A bidirectional text link to the operator: raw bytes in, reply lines out.
#[async_trait]
pub trait CommandLink: Send {
    /// Read whatever bytes are available. `Ok(0)` means the link closed.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    /// Write one reply line; the newline is appended here.
    async fn write_line(&mut self, line: &str) -> std::io::Result<()>;
    fn describe(&self) -> String;
}

/// Any tokio reader/writer pair: stdin/stdout, pipes, in-memory duplex streams.
pub struct StreamLink<R, W> {
    reader: R,
    writer: W,
    name: String,
}

impl<R, W> StreamLink<R, W> {
    pub fn new(reader: R, writer: W, name: impl Into<String>) -> Self {
        Self { reader, writer, name: name.into() }
    }
}

pub fn stdio_link() -> StreamLink<tokio::io::Stdin, tokio::io::Stdout> {
    StreamLink::new(tokio::io::stdin(), tokio::io::stdout(), "stdio")
}

#[async_trait]
impl<R, W> CommandLink for StreamLink<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf).await
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Serial port link, e.g. a USB-UART bridge to a pendant or test sequencer.
pub struct SerialLink {
    port: SerialPort,
    path: String,
    baud: u32,
}

impl SerialLink {
    pub fn open(path: &str, baud: u32) -> std::io::Result<Self> {
        tracing::info!("Opening command link on {} at {} baud", path, baud);
        let port = SerialPort::open(path, baud)?;
        Ok(Self { port, path: path.to_string(), baud })
    }
}

#[async_trait]
impl CommandLink for SerialLink {
    async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.port.read(buf).await {
                // Read timeouts are expected on an idle line.
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                other => return other,
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let mut packet = Vec::with_capacity(line.len() + 2);
        packet.extend_from_slice(line.as_bytes());
        packet.extend_from_slice(b"\r\n");
        let mut written = 0;
        while written < packet.len() {
            match self.port.write(&packet[written..]).await {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "serial port accepted no bytes",
                    ));
                }
                Ok(n) => written += n,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.path, self.baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_link_round_trip() {
        let (client, server) = tokio::io::duplex(64);
        let (server_rx, server_tx) = tokio::io::split(server);
        let mut link = StreamLink::new(server_rx, server_tx, "duplex");

        let (mut client_rx, mut client_tx) = tokio::io::split(client);
        client_tx.write_all(b"pos\n").await.unwrap();

        let mut buf = [0u8; 16];
        let n = link.read_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pos\n");

        link.write_line("[pos] 12.00 mm").await.unwrap();
        let mut reply = vec![0u8; 15];
        client_rx.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"[pos] 12.00 mm\n");
        assert_eq!(link.describe(), "duplex");
    }
}
