//! MJPEG over `multipart/x-mixed-replace`.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::stream::{self, Stream};
use tracing::{info, warn};

use crate::camera::FrameSource;
use crate::codec;

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const SEGMENT_HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
const SEGMENT_TAIL: &[u8] = b"\r\n";

pub fn multipart_segment(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEAD.len() + jpeg.len() + SEGMENT_TAIL.len());
    buf.put_slice(SEGMENT_HEAD);
    buf.put_slice(jpeg);
    buf.put_slice(SEGMENT_TAIL);
    buf.freeze()
}

fn placeholder() -> Option<&'static Bytes> {
    static PLACEHOLDER: OnceLock<Option<Bytes>> = OnceLock::new();
    PLACEHOLDER
        .get_or_init(|| match codec::placeholder_jpeg() {
            Ok(jpeg) => Some(multipart_segment(&jpeg)),
            Err(e) => {
                warn!("video: cannot render placeholder frame: {}", e);
                None
            }
        })
        .as_ref()
}

struct Generator<S: ?Sized> {
    source: Arc<S>,
    interval: Duration,
    real_frames: u64,
    started: bool,
}

impl<S: FrameSource + ?Sized> Generator<S> {
    async fn next_segment(&mut self) -> Bytes {
        loop {
            if self.started {
                tokio::time::sleep(self.interval).await;
            }
            self.started = true;

            if let Some(frame) = self.source.get_frame().await {
                if self.real_frames == 0 {
                    info!("video: first frame from simulator ({} bytes)", frame.encoded.len());
                }
                self.real_frames += 1;
                return multipart_segment(&frame.encoded);
            }
            // Once real frames have flowed, a miss is just a skipped tick.
            if self.real_frames == 0 {
                if let Some(p) = placeholder() {
                    return p.clone();
                }
            }
        }
    }
}

/// Never-ending multipart stream: one segment per tick with a frame, a
/// placeholder while nothing real has arrived yet, nothing otherwise. Ends
/// only when the consumer drops it.
pub fn frame_stream<S>(source: Arc<S>, interval: Duration) -> impl Stream<Item = Bytes> + Send + 'static
where
    S: FrameSource + ?Sized + 'static,
{
    let generator = Generator { source, interval, real_frames: 0, started: false };
    stream::unfold(generator, |mut g| async move {
        let segment = g.next_segment().await;
        Some((segment, g))
    })
}
