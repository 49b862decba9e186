//! Safe TCP bind/connect/read/write helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::MemRepError;

/// Receives an object of type `T` from TCP readable connection `conn_read`,
/// using `read_buf` as buffer storage for partial reads. Returns:
///   - `Ok(obj)` if successful; upon returning, the bytes consumed by this
///     object are discarded from the read buffer
///   - `Err(err)` if any unexpected error occurs
///
/// CANCELLATION SAFETY: we cannot use `read_u64()` and `read_exact()` here
/// because this function may be used as a `tokio::select!` branch and those
/// two methods are not cancellation-safe. Instead, in the case of being
/// cancelled midway before receiving the entire object, bytes already read
/// are kept in the read buffer and will continue to be appended by future
/// invocations until successful returning.
pub(crate) async fn framed_recv<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, MemRepError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    while read_buf.len() < 8 {
        // obj_len not wholesomely read from socket before last cancellation
        let n = conn_read.read_buf(read_buf).await?;
        if n == 0 {
            return Err(MemRepError::msg("connection closed by peer"));
        }
    }
    let obj_len = u64::from_be_bytes(read_buf[..8].try_into().unwrap());

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        let n = conn_read.read_buf(read_buf).await?;
        if n == 0 {
            return Err(MemRepError::msg("connection closed by peer"));
        }
    }
    let obj = rmp_serde::decode::from_slice(&read_buf[8..obj_end])?;

    // if reached this point, no further cancellation to this call is
    // possible (because there are no more awaits ahead); discard bytes
    // used in this call
    if read_buf.len() > obj_end {
        let buf_tail = Bytes::copy_from_slice(&read_buf[obj_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&buf_tail);
    } else {
        read_buf.clear();
    }

    Ok(obj)
}

/// Sends an object of type `T` to TCP writable connection `conn_write`,
/// length-prefixed with its encoded size. Not intended for use as a
/// `tokio::select!` branch.
pub(crate) async fn framed_send<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), MemRepError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = rmp_serde::encode::to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?;
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, MemRepError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` that provides a retrying logic.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, MemRepError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        match socket.connect(conn_addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod safetcp_tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
    struct TestObj {
        seq: u64,
        payload: String,
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn framed_round_trip() -> Result<(), MemRepError> {
        let listener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let conn_addr = listener.local_addr()?;

        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let obj = TestObj {
                seq: 7,
                payload: "ABCDEFGH".into(),
            };
            framed_send(&mut conn, &obj).await.unwrap();
            framed_send(&mut conn, &obj).await.unwrap();
        });

        let mut stream = tcp_connect_with_retry(conn_addr, 0).await?;
        let mut read_buf = BytesMut::new();
        for _ in 0..2 {
            let obj: TestObj = framed_recv(&mut read_buf, &mut stream).await?;
            assert_eq!(
                obj,
                TestObj {
                    seq: 7,
                    payload: "ABCDEFGH".into(),
                }
            );
        }
        Ok(())
    }
}
