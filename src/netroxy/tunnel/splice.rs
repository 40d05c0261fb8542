use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUF_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the first stream to the second.
    Forward,
    /// From the second stream to the first.
    Backward,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

#[derive(Debug)]
pub struct SpliceEnd {
    /// The direction that finished first.
    pub direction: Direction,
    /// Bytes delivered `a -> b`, including those of an unfinished copy.
    pub forward: u64,
    /// Bytes delivered `b -> a`.
    pub backward: u64,
    pub error: Option<std::io::Error>,
}

impl SpliceEnd {
    pub fn total(&self) -> u64 {
        self.forward + self.backward
    }
}

/// Copies bytes both ways between `a` and `b` until either direction hits
/// EOF or an error, then drops both streams.
pub async fn splice<A, B>(a: A, b: B) -> SpliceEnd
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);
    let forward_bytes = AtomicU64::new(0);
    let backward_bytes = AtomicU64::new(0);

    let forward = async {
        let res = pump(&mut ar, &mut bw, &forward_bytes).await;
        let _ = bw.shutdown().await;
        res
    };
    let backward = async {
        let res = pump(&mut br, &mut aw, &backward_bytes).await;
        let _ = aw.shutdown().await;
        res
    };

    let (direction, res) = tokio::select! {
        r = forward => (Direction::Forward, r),
        r = backward => (Direction::Backward, r),
    };

    let end = SpliceEnd {
        direction,
        forward: forward_bytes.load(Ordering::Relaxed),
        backward: backward_bytes.load(Ordering::Relaxed),
        error: res.err(),
    };
    for (dir, n) in [
        (Direction::Forward, end.forward),
        (Direction::Backward, end.backward),
    ] {
        metrics::counter!("netroxy_bytes_total", "direction" => dir.label()).increment(n);
    }
    end
}

async fn pump<R, W>(r: &mut R, w: &mut W, copied: &AtomicU64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_both_ways_and_closes_peer_when_one_side_ends() {
        let (mut outer_a, inner_a) = tokio::io::duplex(1024);
        let (inner_b, mut outer_b) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(inner_a, inner_b));

        outer_a.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        outer_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        outer_b.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        outer_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(outer_a);
        let end = task.await.unwrap();
        assert_eq!(end.direction, Direction::Forward);
        assert_eq!(end.forward, 7);
        assert_eq!(end.backward, 8);
        assert!(end.error.is_none());

        let mut rest = Vec::new();
        outer_b.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn counts_both_directions_when_peer_vanishes() {
        let (mut outer_a, inner_a) = tokio::io::duplex(1024);
        let (inner_b, mut outer_b) = tokio::io::duplex(1024);
        let task = tokio::spawn(splice(inner_a, inner_b));

        outer_a.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        outer_b.read_exact(&mut buf).await.unwrap();
        outer_b.write_all(b"xy").await.unwrap();
        let mut buf = [0u8; 2];
        outer_a.read_exact(&mut buf).await.unwrap();

        // Nothing written after `b` is gone can be delivered.
        drop(outer_b);
        let _ = outer_a.write_all(b"lost").await;
        let end = task.await.unwrap();
        assert_eq!(end.forward, 3);
        assert_eq!(end.backward, 2);
        assert_eq!(end.total(), 5);
    }
}
