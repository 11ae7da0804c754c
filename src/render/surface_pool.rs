use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::foundation::core::Size;

/// Pool configuration for recycled frame surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SurfacePoolOpts {
    /// Maximum bytes retained across all buckets.
    pub max_pool_bytes: usize,
    /// Maximum number of retained surfaces per (w,h,format) bucket.
    pub max_surfaces_per_bucket: usize,
}

impl Default for SurfacePoolOpts {
    fn default() -> Self {
        Self {
            max_pool_bytes: 256 * 1024 * 1024,
            max_surfaces_per_bucket: 8,
        }
    }
}

/// Pixel layout of a pooled surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Straight (non-premultiplied) RGBA, 8 bits per channel.
    Rgba8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SurfaceKey {
    w: u32,
    h: u32,
    format: PixelFormat,
}

impl SurfaceKey {
    fn new(size: Size, format: PixelFormat) -> Self {
        Self {
            w: size.width,
            h: size.height,
            format,
        }
    }

    fn byte_len(self) -> usize {
        match self.format {
            PixelFormat::Rgba8 => Size::new(self.w, self.h).byte_len_rgba8(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SurfacePoolStats {
    pub retained_surfaces: usize,
    pub retained_bytes: usize,
    pub alloc_surfaces: u64,
    pub alloc_bytes: u64,
    pub reused_surfaces: u64,
    pub dropped_on_release: u64,
}

struct Bucket {
    surfaces: Vec<Vec<u8>>,
}

struct PoolInner {
    stats: SurfacePoolStats,
    bucket_idx_by_key: HashMap<SurfaceKey, usize>,
    buckets: Vec<Bucket>,
}

/// Bounded pool of frame buffers shared between decode, composite and encode.
///
/// Keyed by `(width, height, format)`. Buffers come back through [`PooledBuffer`]'s `Drop`, so a
/// frame returns its storage once the last stage (usually the encoder writer) is done with it.
/// Borrow/release happen per frame, never per pixel.
pub struct SurfacePool {
    opts: SurfacePoolOpts,
    inner: Mutex<PoolInner>,
}

impl SurfacePool {
    pub fn new(opts: SurfacePoolOpts) -> Arc<Self> {
        Arc::new(Self {
            opts,
            inner: Mutex::new(PoolInner {
                stats: SurfacePoolStats::default(),
                bucket_idx_by_key: HashMap::new(),
                buckets: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        // A panic while holding the lock leaves only counters behind; keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stats(&self) -> SurfacePoolStats {
        self.lock().stats.clone()
    }

    /// Borrow a buffer of exactly `size` RGBA8 bytes. Contents are unspecified.
    pub fn borrow(self: &Arc<Self>, size: Size) -> PooledBuffer {
        let key = SurfaceKey::new(size, PixelFormat::Rgba8);
        let data = {
            let mut inner = self.lock();
            let reused = inner
                .bucket_idx_by_key
                .get(&key)
                .copied()
                .and_then(|bi| inner.buckets[bi].surfaces.pop());
            match reused {
                Some(buf) => {
                    inner.stats.retained_surfaces = inner.stats.retained_surfaces.saturating_sub(1);
                    inner.stats.retained_bytes =
                        inner.stats.retained_bytes.saturating_sub(key.byte_len());
                    inner.stats.reused_surfaces = inner.stats.reused_surfaces.saturating_add(1);
                    buf
                }
                None => {
                    inner.stats.alloc_surfaces = inner.stats.alloc_surfaces.saturating_add(1);
                    inner.stats.alloc_bytes =
                        inner.stats.alloc_bytes.saturating_add(key.byte_len() as u64);
                    drop(inner);
                    vec![0u8; key.byte_len()]
                }
            }
        };
        PooledBuffer {
            data,
            key,
            home: Some(Arc::clone(self)),
        }
    }

    fn release(&self, key: SurfaceKey, buf: Vec<u8>) {
        let mut inner = self.lock();
        if self.opts.max_pool_bytes == 0 || self.opts.max_surfaces_per_bucket == 0 {
            inner.stats.dropped_on_release = inner.stats.dropped_on_release.saturating_add(1);
            return;
        }

        let bytes = key.byte_len();
        if buf.len() != bytes
            || inner.stats.retained_bytes.saturating_add(bytes) > self.opts.max_pool_bytes
        {
            inner.stats.dropped_on_release = inner.stats.dropped_on_release.saturating_add(1);
            return;
        }

        let bi = match inner.bucket_idx_by_key.get(&key).copied() {
            Some(i) => i,
            None => {
                let i = inner.buckets.len();
                inner.buckets.push(Bucket {
                    surfaces: Vec::new(),
                });
                inner.bucket_idx_by_key.insert(key, i);
                i
            }
        };

        if inner.buckets[bi].surfaces.len() >= self.opts.max_surfaces_per_bucket {
            inner.stats.dropped_on_release = inner.stats.dropped_on_release.saturating_add(1);
            return;
        }

        inner.buckets[bi].surfaces.push(buf);
        inner.stats.retained_surfaces = inner.stats.retained_surfaces.saturating_add(1);
        inner.stats.retained_bytes = inner.stats.retained_bytes.saturating_add(bytes);
    }
}

/// Byte buffer that returns itself to its [`SurfacePool`] on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    key: SurfaceKey,
    home: Option<Arc<SurfacePool>>,
}

impl PooledBuffer {
    /// Wrap a plain allocation; it is simply freed on drop.
    pub fn unpooled(data: Vec<u8>) -> Self {
        Self {
            key: SurfaceKey {
                w: 0,
                h: 0,
                format: PixelFormat::Rgba8,
            },
            data,
            home: None,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Take the bytes out, detaching them from the pool.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.home = None;
        std::mem::take(&mut self.data)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.home.take() {
            pool.release(self.key, std::mem::take(&mut self.data));
        }
    }
}

impl Clone for PooledBuffer {
    fn clone(&self) -> Self {
        Self::unpooled(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reuses_released_buffers() {
        let p = SurfacePool::new(SurfacePoolOpts::default());
        let a = p.borrow(Size::new(8, 8));
        assert_eq!(a.as_slice().len(), 8 * 8 * 4);
        drop(a);
        let _b = p.borrow(Size::new(8, 8));
        let st = p.stats();
        assert_eq!(st.alloc_surfaces, 1);
        assert_eq!(st.reused_surfaces, 1);
    }

    #[test]
    fn pool_honors_bucket_cap() {
        let p = SurfacePool::new(SurfacePoolOpts {
            max_pool_bytes: 1 << 30,
            max_surfaces_per_bucket: 1,
        });
        let a = p.borrow(Size::new(8, 8));
        let b = p.borrow(Size::new(8, 8));
        drop(a);
        drop(b);
        let st = p.stats();
        assert_eq!(st.retained_surfaces, 1);
        assert_eq!(st.dropped_on_release, 1);
    }

    #[test]
    fn pool_honors_global_byte_cap() {
        let bytes_8x8 = Size::new(8, 8).byte_len_rgba8();
        let p = SurfacePool::new(SurfacePoolOpts {
            max_pool_bytes: bytes_8x8,
            max_surfaces_per_bucket: 8,
        });
        let a = p.borrow(Size::new(8, 8));
        let b = p.borrow(Size::new(8, 8));
        drop(a);
        drop(b);
        let st = p.stats();
        assert_eq!(st.retained_bytes, bytes_8x8);
        assert_eq!(st.retained_surfaces, 1);
        assert!(st.dropped_on_release >= 1);
    }

    #[test]
    fn steady_state_allocates_once_per_in_flight_buffer() {
        let p = SurfacePool::new(SurfacePoolOpts::default());
        for _ in 0..100 {
            let a = p.borrow(Size::new(16, 9));
            let b = p.borrow(Size::new(16, 9));
            drop((a, b));
        }
        assert_eq!(p.stats().alloc_surfaces, 2);
    }

    #[test]
    fn detached_buffers_do_not_return() {
        let p = SurfacePool::new(SurfacePoolOpts::default());
        let v = p.borrow(Size::new(2, 2)).into_vec();
        assert_eq!(v.len(), 16);
        assert_eq!(p.stats().retained_surfaces, 0);
        let c = p.borrow(Size::new(2, 2));
        drop(c.clone());
        assert_eq!(p.stats().retained_surfaces, 0);
        drop(c);
        assert_eq!(p.stats().retained_surfaces, 1);
    }
}
