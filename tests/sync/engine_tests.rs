// Tests for the sync engine phases
// Driven by hand through the scripted FakeApi

use std::fs;

use fieldsync::api::{ApiEvent, RemoteFile};
use fieldsync::config::Config;
use fieldsync::error::SyncError;
use fieldsync::fs::{Area, FileRecord};
use fieldsync::sync::SyncNotification;

use crate::support::{count, download_fractions, upload_fractions, Harness};

#[test]
fn test_worked_example() {
    let mut h = Harness::new();
    let a = h.local("a.txt", &[b'a'; 100]);
    let b = h.local("b.txt", &[b'b'; 300]);
    let d = h.both("d.txt", b"doomed", 6);
    let c = FileRecord::cloud("c.txt", 50);

    h.engine.sync(vec![a, b], vec![c], vec![d]).unwrap();
    assert!(h.engine.is_transferring());

    let uploads = h.api().uploads();
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[0].1, "proj/a.txt");
    assert_eq!(uploads[1].1, "proj/b.txt");
    assert!(h.api().deletes().is_empty());
    assert!(h.api().downloads().is_empty());

    h.upload_progress(uploads[0].0, 50, 100);
    h.succeed(uploads[0].0);
    assert!(h.api().deletes().is_empty());
    h.succeed(uploads[1].0);

    let notifications = h.drain();
    assert_eq!(upload_fractions(&notifications).last(), Some(&1.0));
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::UploadFinished)), 1);

    // refresh issued, then the delete phase: local copy gone, remote delete sent
    assert_eq!(h.api().refreshes().len(), 1);
    assert!(!h.path("d.txt").exists());
    let deletes = h.api().deletes();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].1, "proj/d.txt");
    assert!(h.api().downloads().is_empty());

    h.succeed(deletes[0].0);
    assert_eq!(count(&h.drain(), |n| matches!(n, SyncNotification::DeleteFinished)), 1);

    let downloads = h.api().downloads();
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].1, "proj/c.txt");
    let staged = h.engine.staging().unwrap().dir(Area::Download).join("c.txt");
    assert_eq!(downloads[0].2, staged);

    h.redirect(downloads[0].0, "https://storage/c.txt");
    let redirects = h.api().redirects();
    assert_eq!(redirects.len(), 1);
    assert_eq!(redirects[0].1, "https://storage/c.txt");

    h.complete_download(redirects[0].0, &staged, b"remote content");
    assert_eq!(h.read("c.txt"), b"remote content");

    let notifications = h.drain();
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::FileDownloaded { .. })), 1);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::DownloadFinished)), 1);
    // still waiting for the remote listing
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::Finished)), 0);
    assert!(h.engine.is_finished());
    assert!(!h.engine.is_done());

    let refresh = h.api().refreshes()[0];
    h.engine.handle_event(ApiEvent::FileList {
        request: refresh,
        files: vec![RemoteFile {
            name: "c.txt".to_string(),
            size: 14,
            sha256: None,
            last_modified: None,
            versions: Vec::new(),
        }],
    });
    h.succeed(refresh);

    let notifications = h.drain();
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::Finished)), 1);
    assert!(h.engine.is_done());
    assert!(!h.engine.is_transferring());
    assert_eq!(h.engine.remote_files().len(), 1);

    // a duplicate completion changes nothing
    h.succeed(refresh);
    assert!(h.drain().is_empty());
}

#[test]
fn test_staging_reflects_requested_sets() {
    let mut h = Harness::new();
    let up = h.local("data/up.csv", b"1,2");
    let down = FileRecord::cloud("data/down.tif", 3);
    h.engine.sync(vec![up], vec![down], vec![]).unwrap();

    let staging = h.engine.staging().unwrap().clone();
    assert_eq!(staging.staged_names(Area::Upload).unwrap(), vec!["data/up.csv"]);
    assert_eq!(staging.staged_names(Area::Backup).unwrap(), vec!["data/up.csv"]);

    let upload = h.api().uploads()[0].0;
    h.succeed(upload);

    let (request, _, destination) = h.api().downloads()[0].clone();
    h.complete_download(request, &destination, b"tif");

    assert_eq!(staging.staged_names(Area::Download).unwrap(), vec!["data/down.tif"]);
    assert_eq!(h.read("data/down.tif"), b"tif");
}

#[test]
fn test_empty_uploads_reach_delete_synchronously() {
    let mut h = Harness::new();
    let gone = h.local("gone.txt", b"bye");

    h.engine.sync(vec![], vec![], vec![gone]).unwrap();

    assert!(h.api().uploads().is_empty());
    assert!(h.api().deletes().is_empty());
    assert!(!h.path("gone.txt").exists());

    let notifications = h.drain();
    assert_eq!(upload_fractions(&notifications), vec![1.0]);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::DeleteFinished)), 1);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::DownloadFinished)), 1);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::Finished)), 0);

    let refresh = h.api().refreshes()[0];
    h.succeed(refresh);
    assert_eq!(count(&h.drain(), |n| matches!(n, SyncNotification::Finished)), 1);
}

#[test]
fn test_empty_sync_finishes_after_refresh() {
    let mut h = Harness::new();
    h.engine.sync(vec![], vec![], vec![]).unwrap();

    let notifications = h.drain();
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::DeleteFinished)), 1);
    assert!(!h.engine.is_done());

    let refresh = h.api().refreshes()[0];
    h.succeed(refresh);
    assert!(h.engine.is_done());
}

#[test]
fn test_upload_failure_aborts_session() {
    let mut h = Harness::new();
    let records = vec![h.local("a.txt", b"a"), h.local("b.txt", b"b"), h.local("c.txt", b"c")];
    let down = FileRecord::cloud("remote.txt", 1);
    let del = FileRecord::cloud("old.txt", 1);

    h.engine.sync(records, vec![down], vec![del]).unwrap();
    let uploads = h.api().uploads();

    h.fail(uploads[0].0, 500);

    let notifications = h.drain();
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::Aborted)), 1);
    assert!(matches!(
        notifications.iter().find(|n| matches!(n, SyncNotification::Error { .. })),
        Some(SyncNotification::Error { cause: SyncError::Api { .. }, .. })
    ));

    let aborted = h.api().aborted();
    assert_eq!(aborted, vec![uploads[1].0, uploads[2].0]);
    assert!(h.api().deletes().is_empty());
    assert!(h.api().downloads().is_empty());
    assert!(h.api().refreshes().is_empty());

    // late completions and a second abort are ignored
    h.succeed(uploads[1].0);
    h.engine.abort();
    assert!(h.drain().is_empty());
    assert!(h.engine.is_done());
}

#[test]
fn test_upload_progress_is_monotonic() {
    let mut h = Harness::new();
    let a = h.local("a.txt", &[0; 100]);
    let b = h.local("b.txt", &[0; 300]);
    h.engine.sync(vec![a, b], vec![], vec![]).unwrap();
    let uploads = h.api().uploads();
    let (a, b) = (uploads[0].0, uploads[1].0);

    // zero totals are ignored
    h.upload_progress(a, 0, 0);
    assert!(h.drain().is_empty());

    h.upload_progress(a, 50, 100);
    // multipart overhead grows the total
    h.upload_progress(b, 300, 320);
    h.upload_progress(a, 100, 100);
    h.succeed(a);
    h.upload_progress(b, 320, 320);
    h.succeed(b);

    let fractions = upload_fractions(&h.drain());
    assert_eq!(fractions.first(), Some(&0.125));
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]), "{:?}", fractions);
    let (last, pending) = fractions.split_last().unwrap();
    assert_eq!(*last, 1.0);
    assert!(pending.iter().all(|f| *f < 1.0), "{:?}", fractions);
}

#[test]
fn test_zero_byte_uploads_complete() {
    let mut h = Harness::new();
    let empty = h.local("empty.txt", b"");
    h.engine.sync(vec![empty], vec![], vec![]).unwrap();

    let upload = h.api().uploads()[0].0;
    h.succeed(upload);

    let notifications = h.drain();
    assert_eq!(upload_fractions(&notifications), vec![1.0]);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::UploadFinished)), 1);
}

#[test]
fn test_download_concurrency_is_bounded() {
    let config = Config {
        max_parallel_downloads: 2,
        ..Config::default()
    };
    let mut h = Harness::with_config(config);
    let downloads: Vec<FileRecord> = (0..5).map(|i| FileRecord::cloud(format!("f{}.bin", i), 4)).collect();

    h.engine.sync(vec![], downloads, vec![]).unwrap();
    assert_eq!(h.api().downloads().len(), 2);

    let mut completed = 0;
    while completed < 5 {
        let (request, _, destination) = h.api().downloads()[completed].clone();
        h.complete_download(request, &destination, b"data");
        completed += 1;

        let queue = h.engine.download_queue().unwrap();
        assert!(queue.in_flight() <= 2);
        assert!(h.api().downloads().len() <= completed + 2);
    }

    for i in 0..5 {
        assert_eq!(h.read(&format!("f{}.bin", i)), b"data");
    }
    assert_eq!(
        count(&h.drain(), |n| matches!(n, SyncNotification::FileDownloaded { .. })),
        5
    );
}

#[test]
fn test_redirect_chain_is_followed() {
    let mut h = Harness::new();
    h.engine.sync(vec![], vec![FileRecord::cloud("big.tif", 8)], vec![]).unwrap();

    let (first, _, destination) = h.api().downloads()[0].clone();
    h.redirect(first, "https://cdn/1");
    let second = h.api().redirects()[0].0;
    h.redirect(second, "https://cdn/2");
    let third = h.api().redirects()[1].0;
    assert_eq!(h.api().redirects()[1].1, "https://cdn/2");

    // the aborted attempts report back late
    h.fail(first, 499);
    h.fail(second, 499);
    let transfer = h.engine.download_queue().unwrap().transfer("big.tif").unwrap();
    assert!(!transfer.is_finished());
    assert_eq!(transfer.redirects().len(), 2);
    assert!(!h.drain().iter().any(|n| matches!(n, SyncNotification::Error { .. })));

    h.complete_download(third, &destination, b"raster!!");
    let notifications = h.drain();
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::FileDownloaded { .. })), 1);
    assert_eq!(h.read("big.tif"), b"raster!!");
}

#[test]
fn test_download_error_aborts_session() {
    let mut h = Harness::new();
    let downloads = vec![FileRecord::cloud("a.txt", 1), FileRecord::cloud("b.txt", 1)];
    h.engine.sync(vec![], downloads, vec![]).unwrap();

    let (a, _, _) = h.api().downloads()[0].clone();
    let (b, _, _) = h.api().downloads()[1].clone();
    h.fail(a, 404);

    let notifications = h.drain();
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::Error { .. })), 1);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::Aborted)), 1);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::DownloadFinished)), 0);
    assert!(h.api().aborted().contains(&b));
    assert!(!h.path("b.txt").exists());
}

#[test]
fn test_delete_failure_is_not_fatal() {
    let mut h = Harness::new();
    h.engine
        .sync(vec![], vec![], vec![FileRecord::cloud("x.txt", 1), FileRecord::cloud("y.txt", 1)])
        .unwrap();

    let deletes = h.api().deletes();
    h.fail(deletes[0].0, 403);
    assert_eq!(count(&h.drain(), |n| matches!(n, SyncNotification::DeleteFinished)), 0);
    h.succeed(deletes[1].0);

    let notifications = h.drain();
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::DeleteFinished)), 1);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::Aborted)), 0);
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::DownloadFinished)), 1);

    // a repeated completion must not restart the download phase
    h.succeed(deletes[1].0);
    assert!(h.drain().is_empty());
}

#[test]
fn test_commit_failure_rolls_back() {
    let mut h = Harness::new();
    let upload = h.local("notes.txt", b"pristine");
    h.engine
        .sync(vec![upload], vec![FileRecord::cloud("blocked.txt", 4)], vec![])
        .unwrap();

    // the project changes under our feet and the download target is a directory
    h.write("notes.txt", b"half written");
    fs::create_dir_all(h.path("blocked.txt")).unwrap();

    let request = h.api().uploads()[0].0;
    h.succeed(request);
    let (request, _, destination) = h.api().downloads()[0].clone();
    h.complete_download(request, &destination, b"data");

    let notifications = h.drain();
    assert!(notifications
        .iter()
        .any(|n| matches!(n, SyncNotification::Error { cause: SyncError::Commit { .. }, .. })));
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::RolledBack)), 1);
    assert_eq!(h.read("notes.txt"), b"pristine");
}

#[test]
fn test_rollback_failure_is_fatal() {
    let mut h = Harness::new();
    let record = h.both("layer.gpkg", b"old", 3);
    h.engine.sync(vec![], vec![record], vec![]).unwrap();
    let backup_dir = h.engine.staging().unwrap().dir(Area::Backup);

    // neither commit nor rollback can write over a directory
    fs::remove_file(h.path("layer.gpkg")).unwrap();
    fs::create_dir_all(h.path("layer.gpkg")).unwrap();

    let (request, _, destination) = h.api().downloads()[0].clone();
    h.complete_download(request, &destination, b"new");

    let notifications = h.drain();
    assert_eq!(count(&notifications, |n| matches!(n, SyncNotification::RolledBack)), 0);

    let fatal = notifications
        .iter()
        .find_map(|n| match n {
            SyncNotification::Error { message, cause } if cause.is_fatal() => Some(message.clone()),
            _ => None,
        })
        .expect("fatal rollback notification");
    assert!(fatal.contains("Your project might be corrupted"));
    assert!(fatal.contains(&backup_dir.display().to_string()));

    assert!(h.path("layer.gpkg").is_dir());
    assert_eq!(fs::read(backup_dir.join("layer.gpkg")).unwrap(), b"old");
}

#[test]
fn test_side_files_follow_their_database() {
    let mut h = Harness::new();
    let record = h.both("db.gpkg", b"old db", 6);
    h.write("db.gpkg-wal", b"old wal");
    h.write("db.gpkg-shm", b"old shm");

    h.engine.sync(vec![], vec![record], vec![]).unwrap();

    let backup = h.engine.staging().unwrap().dir(Area::Backup);
    assert_eq!(fs::read(backup.join("db.gpkg-wal")).unwrap(), b"old wal");
    assert_eq!(fs::read(backup.join("db.gpkg-shm")).unwrap(), b"old shm");

    let (request, _, destination) = h.api().downloads()[0].clone();
    fs::write(destination.with_file_name("db.gpkg-wal"), b"new wal").unwrap();
    h.complete_download(request, &destination, b"new db");

    assert_eq!(h.read("db.gpkg"), b"new db");
    assert_eq!(h.read("db.gpkg-wal"), b"new wal");
    assert!(!h.path("db.gpkg-shm").exists());
}

#[test]
fn test_sync_twice_is_rejected() {
    let mut h = Harness::new();
    h.engine.sync(vec![], vec![], vec![]).unwrap();
    assert!(matches!(
        h.engine.sync(vec![], vec![], vec![]),
        Err(SyncError::AlreadyStarted)
    ));
}

#[test]
fn test_invalid_record_is_rejected_before_starting() {
    let mut h = Harness::new();
    let mut broken = FileRecord::cloud("a.txt", 1);
    broken.checkout.local = true;

    assert!(matches!(
        h.engine.sync(vec![], vec![broken], vec![]),
        Err(SyncError::InvalidRecord { .. })
    ));
    assert!(!h.engine.is_started());
    assert!(h.api().calls.is_empty());
}

#[test]
fn test_logout_aborts_once() {
    let mut h = Harness::new();
    let record = h.local("a.txt", b"a");
    h.engine.sync(vec![record], vec![], vec![]).unwrap();

    h.engine.on_logout();
    h.engine.on_logout();

    assert_eq!(count(&h.drain(), |n| matches!(n, SyncNotification::Aborted)), 1);
    assert_eq!(h.api().aborted(), vec![h.api().uploads()[0].0]);
}

#[test]
fn test_refresh_before_downloads_finish() {
    let mut h = Harness::new();
    h.engine.sync(vec![], vec![FileRecord::cloud("a.txt", 1)], vec![]).unwrap();

    let refresh = h.api().refreshes()[0];
    h.succeed(refresh);
    assert_eq!(count(&h.drain(), |n| matches!(n, SyncNotification::Finished)), 0);

    let (request, _, destination) = h.api().downloads()[0].clone();
    h.complete_download(request, &destination, b"a");
    assert_eq!(count(&h.drain(), |n| matches!(n, SyncNotification::Finished)), 1);
}

#[test]
fn test_download_progress_is_fraction_of_remote_sizes() {
    let mut h = Harness::new();
    let small = FileRecord::cloud("small.txt", 100);
    let large = FileRecord::cloud("large.txt", 300);
    h.engine.sync(vec![], vec![small, large], vec![]).unwrap();
    h.drain();

    let downloads = h.api().downloads();
    let request = |name: &str| downloads.iter().find(|d| d.1 == format!("proj/{}", name)).unwrap().0;
    let (small, large) = (request("small.txt"), request("large.txt"));

    h.download_progress(small, 50, 100);
    h.download_progress(large, 150, 300);
    assert_eq!(download_fractions(&h.drain()), vec![0.125, 0.5]);

    // the transport may count more bytes than the listing announced
    h.download_progress(small, 120, 120);
    h.download_progress(large, 330, 330);
    assert_eq!(download_fractions(&h.drain()), vec![0.675, 1.0]);
}

#[test]
fn test_download_progress_with_zero_remote_size() {
    let mut h = Harness::new();
    h.engine.sync(vec![], vec![FileRecord::cloud("empty.txt", 0)], vec![]).unwrap();
    h.drain();

    let (request, _, destination) = h.api().downloads()[0].clone();
    h.download_progress(request, 0, 0);
    h.download_progress(request, 3, 3);

    let fractions = download_fractions(&h.drain());
    assert_eq!(fractions, vec![0.0, 1.0]);

    h.complete_download(request, &destination, b"");
    let fractions = download_fractions(&h.drain());
    assert!(fractions.iter().all(|f| f.is_finite() && *f <= 1.0));
    assert_eq!(fractions.last(), Some(&1.0));
}

#[test]
fn test_invalid_control_dir_leaves_project_alone() {
    for control_dir in ["", ".", ".."] {
        let mut h = Harness::with_config(Config {
            control_dir: control_dir.to_string(),
            ..Config::default()
        });
        h.write("project.qgs", b"<qgis/>");

        assert!(matches!(
            h.engine.sync(vec![], vec![], vec![]),
            Err(SyncError::InvalidControlDir { .. })
        ));
        assert!(!h.engine.is_started());
        assert!(h.api().calls.is_empty());
        assert_eq!(h.read("project.qgs"), b"<qgis/>");
    }
}

#[test]
fn test_record_inside_control_dir_is_rejected() {
    let mut h = Harness::new();
    let staged = h.local(".fieldsync/upload/a.txt", b"a");

    assert!(matches!(
        h.engine.sync(vec![staged], vec![], vec![]),
        Err(SyncError::InvalidRecord { .. })
    ));
    assert!(!h.engine.is_started());
}
