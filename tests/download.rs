mod common;

use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{fast_config, test_data, MockRemote, RangeRequest};
use pantransfer::download::{Downloader, FileWriter, MemoryWriter, WriteAt};
use pantransfer::error::Disposition;
use pantransfer::transfer::{InstanceState, Range, RangeGenMode, StateFile};
use pantransfer::{TransferConfig, TransferError, TransferEvent};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_worker_is_healed_and_download_completes() {
    let data = test_data(1_000_000);
    let remote = Arc::new(MockRemote::new(data.clone()));
    remote.fail_request_at(500_000, 100_000);
    let writer = Arc::new(MemoryWriter::new());
    let config = TransferConfig {
        slice_parallel: 4,
        reload_workers: false,
        ..fast_config()
    };

    let downloader = Downloader::new(remote.clone(), remote.file(), writer.clone(), config);
    downloader.execute().await.unwrap();

    assert_eq!(writer.contents(), data);
    assert_eq!(downloader.status().unwrap().transferred(), 1_000_000);

    let requests = remote.range_requests();
    let mut first: Vec<RangeRequest> = requests[..4].to_vec();
    first.sort_by_key(|r| r.offset);
    let lengths: Vec<i64> = first.iter().map(|r| r.end - r.offset).collect();
    assert_eq!(lengths, vec![250_000; 4]);
    // the healed worker picks up where the broken stream stopped
    assert!(requests.contains(&RangeRequest {
        offset: 600_000,
        end: 750_000,
    }));
}

#[tokio::test]
async fn empty_file_succeeds_without_workers_or_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("empty.bin.part.json");
    let remote = Arc::new(MockRemote::new(Vec::new()));
    let config = TransferConfig {
        instance_state_path: Some(state_path.clone()),
        ..fast_config()
    };

    let downloader = Downloader::new(
        remote.clone(),
        remote.file(),
        Arc::new(MemoryWriter::new()),
        config,
    );
    let mut events = downloader.subscribe();
    downloader.execute().await.unwrap();

    assert!(downloader.status().is_none());
    assert!(remote.requests().is_empty());
    assert!(!state_path.exists());
    assert!(matches!(events.recv().await.unwrap(), TransferEvent::Success));
    assert!(matches!(events.recv().await.unwrap(), TransferEvent::Finish));
}

#[tokio::test]
async fn resuming_a_finished_transfer_makes_no_requests() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("done.bin.part.json");
    let store = StateFile::open(&state_path).await.unwrap();
    let state = InstanceState {
        version: 1,
        saved_at: None,
        mode: RangeGenMode::Default,
        total_size: 1000,
        gen_begin: 1000,
        block_size: 250,
        ranges: vec![
            Range::new(250, 250),
            Range::new(500, 500),
            Range::new(750, 750),
            Range::new(1000, 1000),
        ],
    };
    store.put(&state).await.unwrap();
    drop(store);

    let remote = Arc::new(MockRemote::new(test_data(1000)));
    let config = TransferConfig {
        instance_state_path: Some(state_path.clone()),
        ..fast_config()
    };
    let downloader = Downloader::new(
        remote.clone(),
        remote.file(),
        Arc::new(MemoryWriter::new()),
        config,
    );
    downloader.execute().await.unwrap();

    assert_eq!(remote.url_calls(), 0);
    assert!(remote.requests().is_empty());
    assert!(!state_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_download_resumes_without_refetching() {
    const TOTAL: usize = 10 * 1024 * 1024;
    let dir = tempfile::tempdir().unwrap();
    let part_path = dir.path().join("big.bin.part");
    let state_path = dir.path().join("big.bin.part.json");
    let data = test_data(TOTAL);
    let config = TransferConfig {
        slice_parallel: 4,
        reload_workers: false,
        instance_state_path: Some(state_path.clone()),
        ..fast_config()
    };

    // first run stalls once 40% has been served, then gets canceled
    let budget = (TOTAL as u64) * 4 / 10;
    let remote = Arc::new(MockRemote::new(data.clone()).with_serve_budget(budget));
    let writer = Arc::new(FileWriter::open(&part_path).await.unwrap());
    let downloader = Arc::new(Downloader::new(
        remote.clone(),
        remote.file(),
        writer,
        config.clone(),
    ));
    let run = tokio::spawn({
        let downloader = downloader.clone();
        async move { downloader.execute().await }
    });
    tokio::time::timeout(Duration::from_secs(20), async {
        while remote.served() < budget {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    downloader.cancel();
    let first = run.await.unwrap();
    assert!(matches!(first, Err(TransferError::Canceled)));

    let saved = StateFile::open(&state_path)
        .await
        .unwrap()
        .get::<InstanceState>()
        .await
        .unwrap();
    let done = saved.transferred();
    assert!(done > 0 && done < TOTAL as i64);
    assert_eq!(saved.outstanding(), TOTAL as i64 - done);

    // second run in a fresh engine picks up the saved ranges
    let remote = Arc::new(MockRemote::new(data.clone()));
    let writer = Arc::new(FileWriter::open(&part_path).await.unwrap());
    let downloader = Downloader::new(remote.clone(), remote.file(), writer.clone(), config);
    downloader.execute().await.unwrap();
    writer.sync_all().await.unwrap();

    assert_eq!(downloader.status().unwrap().transferred(), TOTAL as i64);
    assert_eq!(tokio::fs::read(&part_path).await.unwrap(), data);
    assert!(!state_path.exists());

    let requests = remote.range_requests();
    for request in &requests {
        assert!(
            saved
                .ranges
                .iter()
                .any(|r| request.offset >= r.begin && request.end <= r.end),
            "{:?} reaches into bytes already on disk",
            request
        );
    }
    for (i, a) in requests.iter().enumerate() {
        for b in &requests[i + 1..] {
            assert!(a.end <= b.offset || b.end <= a.offset, "{:?} overlaps {:?}", a, b);
        }
    }
    assert_eq!(remote.served(), (TOTAL as i64 - done) as u64);
}

#[tokio::test]
async fn server_without_ranges_is_read_in_one_stream() {
    let data = test_data(300_000);
    let remote = Arc::new(MockRemote::new(data.clone()).without_ranges());
    let writer = Arc::new(MemoryWriter::new());
    let downloader = Downloader::new(remote.clone(), remote.file(), writer.clone(), fast_config());
    downloader.execute().await.unwrap();

    assert_eq!(writer.contents(), data);
    assert_eq!(remote.requests(), vec![None]);
}

#[tokio::test]
async fn forbidden_download_url_removes_partial_output() {
    let dir = tempfile::tempdir().unwrap();
    let part_path = dir.path().join("blocked.bin.part");
    let state_path = dir.path().join("blocked.bin.part.json");
    let remote = Arc::new(
        MockRemote::new(test_data(1000))
            .with_urls(&["https://pdsapi.aliyundrive.com/v2/file/download?file_id=1"]),
    );
    let writer = Arc::new(FileWriter::open(&part_path).await.unwrap());
    let config = TransferConfig {
        instance_state_path: Some(state_path.clone()),
        ..fast_config()
    };
    let downloader = Downloader::new(remote.clone(), remote.file(), writer, config);

    let err = downloader.execute().await.unwrap_err();
    assert!(matches!(err, TransferError::Forbidden));
    assert!(!part_path.exists());
    assert!(!state_path.exists());
    assert!(remote.requests().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_mode_hands_out_every_block() {
    let data = test_data(200_000);
    let remote = Arc::new(MockRemote::new(data.clone()));
    let writer = Arc::new(MemoryWriter::new());
    let config = TransferConfig {
        mode: RangeGenMode::BlockSize,
        slice_parallel: 2,
        block_size: 30_000,
        reload_workers: false,
        ..fast_config()
    };
    let downloader = Downloader::new(remote.clone(), remote.file(), writer.clone(), config);
    downloader.execute().await.unwrap();

    assert_eq!(writer.contents(), data);
    let mut requests = remote.range_requests();
    requests.sort_by_key(|r| r.offset);
    assert_eq!(requests.len(), 7);
    assert_eq!(requests[0], RangeRequest { offset: 0, end: 30_000 });
    assert_eq!(requests[6], RangeRequest { offset: 180_000, end: 200_000 });
}

#[tokio::test]
async fn cancel_before_start_keeps_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("c.bin.part.json");
    let remote = Arc::new(MockRemote::new(test_data(100_000)).with_chunk_delay(Duration::from_millis(50)));
    let config = TransferConfig {
        slice_parallel: 2,
        instance_state_path: Some(state_path.clone()),
        ..fast_config()
    };
    let downloader = Downloader::new(
        remote.clone(),
        remote.file(),
        Arc::new(MemoryWriter::new()),
        config,
    );
    downloader.cancel();
    let err = downloader.execute().await.unwrap_err();
    assert!(matches!(err, TransferError::Canceled));

    let saved = StateFile::open(&state_path)
        .await
        .unwrap()
        .get::<InstanceState>()
        .await
        .unwrap();
    assert_eq!(saved.outstanding(), 100_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_holds_progress_until_resume() {
    let data = test_data(400_000);
    let remote = Arc::new(
        MockRemote::new(data.clone())
            .with_chunk_size(4096)
            .with_chunk_delay(Duration::from_millis(2)),
    );
    let writer = Arc::new(MemoryWriter::new());
    let config = TransferConfig {
        slice_parallel: 2,
        reload_workers: false,
        ..fast_config()
    };
    let downloader = Arc::new(Downloader::new(remote.clone(), remote.file(), writer.clone(), config));
    let mut events = downloader.subscribe();

    let handle = {
        let downloader = downloader.clone();
        tokio::spawn(async move { downloader.execute().await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while remote.served() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    downloader.pause();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let held = remote.served();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(remote.served(), held);
    assert!(held < 400_000);

    downloader.resume();
    handle.await.unwrap().unwrap();
    assert_eq!(writer.contents(), data);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if !matches!(event, TransferEvent::Status(_)) {
            seen.push(event);
        }
    }
    assert_eq!(
        seen,
        vec![
            TransferEvent::Execute,
            TransferEvent::Pause,
            TransferEvent::Resume,
            TransferEvent::Success,
            TransferEvent::Finish,
        ]
    );
}

#[tokio::test]
async fn broken_single_stream_restarts_from_first_byte() {
    let data = test_data(300_000);
    let remote = Arc::new(MockRemote::new(data.clone()).without_ranges());
    remote.fail_request_at(0, 100_000);
    let writer = Arc::new(MemoryWriter::new());

    let downloader = Downloader::new(remote.clone(), remote.file(), writer.clone(), fast_config());
    downloader.execute().await.unwrap();

    assert_eq!(remote.requests(), vec![None, None]);
    assert_eq!(writer.contents(), data);
    let status = downloader.status().unwrap();
    assert_eq!(status.transferred(), 300_000);
    assert_eq!(status.total_size(), 300_000);
}

#[tokio::test]
async fn fresh_start_cuts_a_longer_leftover_part_file() {
    let dir = tempfile::tempdir().unwrap();
    let part_path = dir.path().join("data.bin.part");
    let state_path = dir.path().join("data.bin.part.json");
    tokio::fs::write(&part_path, vec![0xAB; 200_000]).await.unwrap();
    tokio::fs::write(&state_path, b"{garbage").await.unwrap();

    let data = test_data(100_000);
    let remote = Arc::new(MockRemote::new(data.clone()));
    let writer = Arc::new(FileWriter::open(&part_path).await.unwrap());
    let config = TransferConfig {
        instance_state_path: Some(state_path.clone()),
        ..fast_config()
    };
    let downloader = Downloader::new(remote.clone(), remote.file(), writer.clone(), config);
    downloader.execute().await.unwrap();
    writer.sync_all().await.unwrap();

    assert_eq!(tokio::fs::read(&part_path).await.unwrap(), data);
    assert!(!state_path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rate_limited_download_completes() {
    let data = test_data(300_000);
    let remote = Arc::new(MockRemote::new(data.clone()));
    let writer = Arc::new(MemoryWriter::new());
    let config = TransferConfig {
        slice_parallel: 3,
        max_rate: 200_000,
        ..fast_config()
    };

    let started = Instant::now();
    let downloader = Downloader::new(remote.clone(), remote.file(), writer.clone(), config);
    downloader.execute().await.unwrap();

    // one second of burst passes at once, the remaining 100 KB take half a second
    assert!(started.elapsed() >= Duration::from_millis(350));
    assert_eq!(writer.contents(), data);
    assert_eq!(remote.range_requests().len(), 3);
}

struct FullDisk;

#[async_trait]
impl WriteAt for FullDisk {
    async fn write_at(&self, _buf: &[u8], offset: i64) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("no space left at {}", offset),
        ))
    }
}

#[tokio::test]
async fn write_failure_aborts_the_whole_transfer() {
    let remote = Arc::new(MockRemote::new(test_data(200_000)));
    let config = TransferConfig {
        slice_parallel: 2,
        ..fast_config()
    };
    let downloader = Downloader::new(remote.clone(), remote.file(), Arc::new(FullDisk), config);
    let mut events = downloader.subscribe();

    let err = downloader.execute().await.unwrap_err();
    match &err {
        TransferError::Fatal(msg) => assert!(msg.contains("write failed"), "{}", msg),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.disposition(), Disposition::Abort);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        failed |= matches!(event, TransferEvent::Failed(_));
    }
    assert!(failed);
}
