//! Coordinator-level integration tests.
//!
//! These run without cameras or a GPU: they exercise registration,
//! isolation of start failures, statistics aggregation, and clean shutdown.
//! An unreachable loopback URL makes RTSP negotiation fail fast and
//! deterministically.

use gridstream::{
    CameraConfig, PipelineConfig, PipelineCoordinator, StreamQuality, StreamState,
};

fn test_pipeline() -> PipelineCoordinator {
    let mut coordinator = PipelineCoordinator::new(PipelineConfig {
        network_threads: 2,
        decode_threads: 1,
        ..PipelineConfig::default()
    });
    coordinator.initialize().expect("initialize");
    coordinator
}

/// Loopback port 9 (discard); nothing listens there in the test
/// environment, so connects are refused immediately.
fn unreachable_camera(id: &str) -> CameraConfig {
    let mut config = CameraConfig::new(id, "rtsp://127.0.0.1:9/stream1");
    config.auto_reconnect = false;
    config
}

mod registration_tests {
    use super::*;

    #[test]
    fn test_failed_start_leaves_camera_in_error() {
        let mut coordinator = test_pipeline();

        let result = coordinator.add_camera(unreachable_camera("cam-a"));
        assert!(result.is_err(), "start error must surface to the caller");

        // The camera stays registered so operators can see the failure.
        assert_eq!(coordinator.camera_count(), 1);
        assert_eq!(
            coordinator.camera_state("cam-a").unwrap(),
            StreamState::Error
        );

        let stats = coordinator.global_stats();
        assert_eq!(stats.total_cameras, 1);
        assert_eq!(stats.active_cameras, 0);
        assert_eq!(stats.error_cameras, 1);

        coordinator.shutdown();
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let mut coordinator = test_pipeline();
        let _ = coordinator.add_camera(unreachable_camera("cam-dup"));
        let second = coordinator.add_camera(unreachable_camera("cam-dup"));
        assert!(second.is_err());
        assert_eq!(coordinator.camera_count(), 1);
        coordinator.shutdown();
    }

    #[test]
    fn test_remove_camera() {
        let mut coordinator = test_pipeline();
        let _ = coordinator.add_camera(unreachable_camera("cam-rm"));
        coordinator.remove_camera("cam-rm").unwrap();
        assert_eq!(coordinator.camera_count(), 0);
        assert!(coordinator.remove_camera("cam-rm").is_err());
        coordinator.shutdown();
    }

    #[test]
    fn test_camera_isolation() {
        // One failing camera must not affect another's registration.
        let mut coordinator = test_pipeline();
        let _ = coordinator.add_camera(unreachable_camera("cam-1"));
        let _ = coordinator.add_camera(unreachable_camera("cam-2"));

        assert_eq!(coordinator.camera_count(), 2);
        let stats = coordinator.global_stats();
        assert_eq!(stats.error_cameras, 2);
        assert_eq!(stats.total_decoded_frames, 0);
        coordinator.shutdown();
    }
}

mod quality_tests {
    use super::*;

    #[test]
    fn test_set_quality_on_error_camera() {
        let mut coordinator = test_pipeline();
        let _ = coordinator.add_camera(unreachable_camera("cam-q"));
        // Quality changes apply even when the camera is not running.
        coordinator
            .set_quality("cam-q", StreamQuality::Fullscreen)
            .unwrap();
        coordinator.set_all_quality(StreamQuality::Thumbnail);
        coordinator.shutdown();
    }
}

mod stats_tests {
    use super::*;

    #[test]
    fn test_global_stats_include_pools_and_memory() {
        let mut coordinator = test_pipeline();
        let stats = coordinator.global_stats();
        assert_eq!(stats.network_pool.per_worker_completed.len(), 2);
        assert_eq!(stats.decode_pool.per_worker_decode_count.len(), 1);
        assert_eq!(stats.memory.total_allocated_bytes, 0);
        assert!(stats.avg_fps.abs() < f64::EPSILON);
        coordinator.shutdown();
    }

    #[test]
    fn test_stats_serialize() {
        let mut coordinator = test_pipeline();
        let stats = coordinator.global_stats();
        let json = serde_json::to_string(&stats).expect("stats must serialize");
        assert!(json.contains("total_cameras"));
        coordinator.shutdown();
    }
}

mod shutdown_tests {
    use super::*;

    #[test]
    fn test_shutdown_rejects_further_cameras() {
        let mut coordinator = test_pipeline();
        coordinator.shutdown();
        assert!(coordinator.add_camera(unreachable_camera("late")).is_err());
    }

    #[test]
    fn test_shutdown_with_registered_cameras() {
        let mut coordinator = test_pipeline();
        let _ = coordinator.add_camera(unreachable_camera("cam-x"));
        let _ = coordinator.add_camera(unreachable_camera("cam-y"));
        // Must not hang or leak worker threads.
        coordinator.shutdown();
        assert!(!coordinator.is_initialized());
    }
}
