//! Bidirectional byte splicing between two streams.

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};

const BUFFER_LEN: usize = 16 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpliceSummary {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

struct Activity {
    start: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_millis.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.start.elapsed().saturating_sub(last)
    }
}

/// Copies `a -> b` and `b -> a` until both directions reach end of stream.
///
/// End of stream on one side shuts down the write side of the other, so a
/// half-close propagates. An error in either direction ends both. With an
/// `idle_timeout`, a splice that moves no bytes for that long fails with
/// [`io::ErrorKind::TimedOut`].
pub async fn splice<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> io::Result<SpliceSummary>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let activity = Activity::new();

    let forward = copy_half(&mut a_read, &mut b_write, &activity);
    let backward = copy_half(&mut b_read, &mut a_write, &activity);
    tokio::pin!(forward, backward);

    let check_every = idle_timeout
        .map(|timeout| (timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1)))
        .unwrap_or(Duration::from_secs(3600));
    let mut idle_check = tokio::time::interval(check_every);

    let mut a_to_b = None;
    let mut b_to_a = None;
    loop {
        if let (Some(a_to_b), Some(b_to_a)) = (a_to_b, b_to_a) {
            return Ok(SpliceSummary { a_to_b, b_to_a });
        }
        tokio::select! {
            copied = &mut forward, if a_to_b.is_none() => a_to_b = Some(copied?),
            copied = &mut backward, if b_to_a.is_none() => b_to_a = Some(copied?),
            _ = idle_check.tick() => {
                if let Some(timeout) = idle_timeout {
                    if activity.idle_for() >= timeout {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "splice idle"));
                    }
                }
            }
        }
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, activity: &Activity) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_LEN];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            match writer.shutdown().await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
                Err(err) => return Err(err),
            }
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total += n as u64;
        activity.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_both_directions_and_propagates_eof() {
        let (client, client_far) = tokio::io::duplex(1024);
        let (server, server_far) = tokio::io::duplex(1024);
        let spliced = tokio::spawn(splice(client_far, server_far, None));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"request").await.unwrap();
        client_write.shutdown().await.unwrap();
        let mut request = Vec::new();
        server_read.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        server_write.write_all(b"response!").await.unwrap();
        server_write.shutdown().await.unwrap();
        let mut response = Vec::new();
        client_read.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response!");

        let summary = spliced.await.unwrap().unwrap();
        assert_eq!(summary, SpliceSummary { a_to_b: 7, b_to_a: 9 });
    }

    #[tokio::test(start_paused = true)]
    async fn idle_splice_times_out() {
        let (_client, client_far) = tokio::io::duplex(1024);
        let (_server, server_far) = tokio::io::duplex(1024);

        let err = splice(client_far, server_far, Some(Duration::from_secs(30)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
