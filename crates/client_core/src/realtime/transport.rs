use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use url::Url;

use crate::error::TransportError;

/// What the channel manager sees of the wire: text frames and closes. Pings,
/// pongs and binary frames at the websocket layer never surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

pub struct ChannelIo {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<ChannelIo, TransportError>;
}

pub struct WsConnector;

fn to_ws_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Close => WsMessage::Close(None),
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<ChannelIo, TransportError> {
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (ws_writer, ws_reader) = ws_stream.split();

        let sink = ws_writer
            .sink_map_err(|err| TransportError::Send(err.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_ws_message(frame))));
        let stream = ws_reader.filter_map(|message| {
            future::ready(match message {
                Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(WsMessage::Close(_)) => Some(Ok(Frame::Close)),
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::Receive(err.to_string()))),
            })
        });

        Ok(ChannelIo {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
