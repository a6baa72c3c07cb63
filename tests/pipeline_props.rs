//! Property-based tests for the pipeline's pure and concurrent invariants.
//!
//! Run with: cargo test --test pipeline_props

use gridstream::gpu::{AccountantConfig, GpuMemoryAccountant};
use gridstream::{BoundedQueue, Codec, StreamQuality};
use proptest::prelude::*;

fn any_quality() -> impl Strategy<Value = StreamQuality> {
    prop_oneof![
        Just(StreamQuality::Paused),
        Just(StreamQuality::Thumbnail),
        Just(StreamQuality::GridView),
        Just(StreamQuality::Focused),
        Just(StreamQuality::Fullscreen),
    ]
}

proptest! {
    /// INVARIANT: the quality mappings are pure and match the table:
    /// Paused 1/2, Thumbnail 5/4, GridView 10/4, Focused 15/8,
    /// Fullscreen 30/12.
    #[test]
    fn quality_mapping_is_pure(quality in any_quality()) {
        let fps_a = quality.target_fps();
        let fps_b = quality.target_fps();
        prop_assert_eq!(fps_a, fps_b);

        let expected = match quality {
            StreamQuality::Paused => (1, 2),
            StreamQuality::Thumbnail => (5, 4),
            StreamQuality::GridView => (10, 4),
            StreamQuality::Focused => (15, 8),
            StreamQuality::Fullscreen => (30, 12),
        };
        prop_assert_eq!((quality.target_fps(), quality.surface_pool_size()), expected);
    }

    /// INVARIANT: for any push/pop interleaving by one producer and one
    /// consumer, popped values preserve push order and the size never
    /// exceeds capacity.
    #[test]
    fn queue_preserves_order(
        capacity in 1usize..32,
        ops in prop::collection::vec(prop::bool::ANY, 0..200),
    ) {
        let queue = BoundedQueue::with_capacity(capacity);
        let mut next_push = 0u32;
        let mut next_expected = 0u32;

        for is_push in ops {
            if is_push {
                if queue.push(next_push).is_ok() {
                    next_push += 1;
                }
            } else if let Some(value) = queue.pop() {
                prop_assert_eq!(value, next_expected);
                next_expected += 1;
            }
            prop_assert!(queue.len() <= queue.capacity());
        }

        // Drain: everything pushed and not yet popped comes out in order.
        while let Some(value) = queue.pop() {
            prop_assert_eq!(value, next_expected);
            next_expected += 1;
        }
        prop_assert_eq!(next_expected, next_push);
    }

    /// INVARIANT: push_or_drop_oldest always succeeds and afterwards the
    /// newest value is at the tail.
    #[test]
    fn drop_oldest_always_succeeds(
        capacity in 1usize..16,
        values in prop::collection::vec(0u32..1000, 1..100),
    ) {
        let queue = BoundedQueue::with_capacity(capacity);
        for &value in &values {
            queue.push_or_drop_oldest(value);
        }

        let mut drained = Vec::new();
        while let Some(value) = queue.pop() {
            drained.push(value);
        }
        prop_assert!(!drained.is_empty());
        prop_assert_eq!(*drained.last().unwrap(), *values.last().unwrap());
        // The survivors are exactly the newest suffix of the input.
        let suffix = &values[values.len() - drained.len()..];
        prop_assert_eq!(drained.as_slice(), suffix);
    }

    /// INVARIANT: across any register/unregister/update sequence, the total
    /// equals the sum of per-camera bytes and the peak never falls below
    /// any observed total.
    #[test]
    fn accountant_conserves_bytes(
        ops in prop::collection::vec(
            (0u8..3, 0usize..6, 0u64..10_000, 0usize..16),
            0..100,
        ),
    ) {
        let accountant = GpuMemoryAccountant::new(AccountantConfig {
            max_gpu_memory_bytes: u64::MAX,
            enable_warnings: false,
        });
        let mut max_total_seen = 0u64;

        for (op, camera, bytes, surfaces) in ops {
            let id = format!("cam-{}", camera);
            match op {
                0 => accountant.register(&id, bytes, surfaces),
                1 => accountant.unregister(&id),
                _ => accountant.update(&id, bytes, surfaces),
            }
            let stats = accountant.stats();
            let sum: u64 = stats.per_camera_bytes.values().sum();
            prop_assert_eq!(stats.total_allocated_bytes, sum);
            max_total_seen = max_total_seen.max(stats.total_allocated_bytes);
            prop_assert!(stats.peak_allocated_bytes >= max_total_seen);
        }
    }

    /// The Annex-B splitter never panics and every emitted unit begins with
    /// a start code, whatever the input bytes.
    #[test]
    fn parser_tolerates_arbitrary_bytes(
        data in prop::collection::vec(any::<u8>(), 0..512),
        pts in any::<i64>(),
    ) {
        let units = gridstream::bitstream::parse_annex_b(&data, pts, Codec::H264);
        for unit in units {
            let starts_3 = unit.data.starts_with(&[0, 0, 1]);
            let starts_4 = unit.data.starts_with(&[0, 0, 0, 1]);
            prop_assert!(starts_3 || starts_4);
            prop_assert_eq!(unit.pts, pts);
        }
    }

    /// The SPS parser never panics on arbitrary payloads, and any accepted
    /// parse reports positive dimensions and framerate.
    #[test]
    fn sps_parser_never_panics(data in prop::collection::vec(any::<u8>(), 0..128)) {
        let mut nal = vec![0x67];
        nal.extend(&data);
        if let Some(info) = gridstream::bitstream::parse_sps(&nal) {
            prop_assert!(info.width > 0);
            prop_assert!(info.height > 0);
            prop_assert!(info.framerate > 0);
        }
    }
}
