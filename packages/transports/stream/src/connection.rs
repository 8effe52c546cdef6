use async_std::channel::Sender;
use futures_util::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use satlink_codec::{encode_frame, FrameDecoder, FrameEvent, LinkError, PacketLink, PacketReceiver, PacketSender, Value, DEFAULT_MAX_FRAME};

pub const BUFFER_LEN: usize = 1500;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Byte that starts every frame. Needed when the stream also carries console text.
    pub lead_in: Option<u8>,
    pub max_frame: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            lead_in: None,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }
}

pub struct StreamSender<W> {
    writer: W,
    config: StreamConfig,
}

impl<W> StreamSender<W> {
    pub fn new(writer: W, config: StreamConfig) -> Self {
        Self { writer, config }
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> PacketSender for StreamSender<W> {
    async fn send(&mut self, packet: Value) -> Result<(), LinkError> {
        let payload = bincode::serialize(&packet).map_err(|e| LinkError::Codec(e.to_string()))?;
        let frame = encode_frame(self.config.lead_in, &payload, self.config.max_frame).map_err(|e| LinkError::Codec(e.to_string()))?;
        self.writer.write_all(&frame).await.map_err(|e| LinkError::Io(e.to_string()))?;
        self.writer.flush().await.map_err(|e| LinkError::Io(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.writer.close().await {
            log::warn!("[StreamSender] close error {:?}", e);
        }
    }
}

pub struct StreamReceiver<R> {
    reader: R,
    decoder: FrameDecoder,
    console: Option<Sender<Vec<u8>>>,
    buf: [u8; BUFFER_LEN],
}

impl<R> StreamReceiver<R> {
    pub fn new(reader: R, config: StreamConfig, console: Option<Sender<Vec<u8>>>) -> Self {
        Self {
            reader,
            decoder: FrameDecoder::new(config.lead_in, config.max_frame),
            console,
            buf: [0; BUFFER_LEN],
        }
    }
}

#[async_trait::async_trait]
impl<R: AsyncRead + Unpin + Send> PacketReceiver for StreamReceiver<R> {
    async fn recv(&mut self) -> Result<Value, LinkError> {
        loop {
            while let Some(event) = self.decoder.pop_event() {
                match event {
                    FrameEvent::Packet(payload) => match bincode::deserialize::<Value>(&payload) {
                        Ok(value) => return Ok(value),
                        Err(e) => log::warn!("[StreamReceiver] drop undecodable packet: {:?}", e),
                    },
                    FrameEvent::Console(line) => {
                        log::info!("[StreamReceiver] console: {}", String::from_utf8_lossy(&line));
                        if let Some(console) = &self.console {
                            if console.try_send(line).is_err() {
                                log::debug!("[StreamReceiver] console sink full or gone");
                            }
                        }
                    }
                    FrameEvent::Corrupt(e) => log::warn!("[StreamReceiver] corrupt frame: {}", e),
                }
            }
            let size = self.reader.read(&mut self.buf).await.map_err(|e| LinkError::Io(e.to_string()))?;
            if size == 0 {
                log::info!("[StreamReceiver] stream closed");
                return Err(LinkError::Closed);
            }
            self.decoder.feed(&self.buf[..size]);
        }
    }
}

/// Split a duplex byte stream into a framed packet link.
pub fn stream_link<S>(stream: S, config: StreamConfig, console: Option<Sender<Vec<u8>>>) -> PacketLink
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = stream.split();
    PacketLink::new(Box::new(StreamSender::new(writer, config.clone())), Box::new(StreamReceiver::new(reader, config, console)))
}
