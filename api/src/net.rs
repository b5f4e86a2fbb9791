//! Request/response framing
//!
//! Every message on a connection is a frame: a fixed header carrying the
//! body length, a caller-chosen request id, the method selector and the
//! sender's node id, followed by the binrw-encoded body. Responses reuse the
//! frame shape with the request id echoed back, so replies may arrive out of
//! order.
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::NodeId;

pub const FRAME_HEADER_SIZE: usize = 4 + 8 + 1 + 8;

#[derive(Debug, Clone)]
pub struct Frame {
    pub request_id: u64,
    pub method: u8,
    pub sender: NodeId,
    pub body: Vec<u8>,
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header[..4].copy_from_slice(&u32::try_from(frame.body.len()).expect("body too large").to_le_bytes());
    header[4..12].copy_from_slice(&frame.request_id.to_le_bytes());
    header[12] = frame.method;
    header[13..21].copy_from_slice(&frame.sender.0.to_le_bytes());

    writer.write_all(&header).await?;
    writer.write_all(&frame.body).await?;
    writer.flush().await
}

/// Read one frame; `Ok(None)` means the peer closed the connection.
pub async fn read_frame<R>(reader: &mut R, max_message_size: usize) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let body_len = u32::from_le_bytes(header[..4].try_into().expect("can't fail")) as usize;
    if body_len > max_message_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body of {body_len} bytes exceeds limit"),
        ));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    Ok(Some(Frame {
        request_id: u64::from_le_bytes(header[4..12].try_into().expect("can't fail")),
        method: header[12],
        sender: NodeId(u64::from_le_bytes(header[13..21].try_into().expect("can't fail"))),
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = Frame {
            request_id: 7,
            method: 2,
            sender: NodeId(1),
            body: vec![1, 2, 3, 4],
        };
        write_frame(&mut client, &frame).await.unwrap();
        drop(client);

        let read = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(read.request_id, 7);
        assert_eq!(read.method, 2);
        assert_eq!(read.sender, NodeId(1));
        assert_eq!(read.body, vec![1, 2, 3, 4]);

        assert!(read_frame(&mut server, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = Frame {
            request_id: 1,
            method: 1,
            sender: NodeId(0),
            body: vec![0; 512],
        };
        write_frame(&mut client, &frame).await.unwrap();

        assert!(read_frame(&mut server, 16).await.is_err());
    }
}
