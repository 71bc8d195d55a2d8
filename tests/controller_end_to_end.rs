use std::collections::HashMap;
use std::fs;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vdrive::media::{
    open_raw_file, IoReqFlags, IoReqHandle, IoStatus, MediaConfig, MediaDriver, MediaError,
    MediaExPort, Result,
};

const SECTOR: usize = 512;
const SECTORS: u64 = 2048;

/// Minimal storage controller: sector-sized guest buffers and a completion queue.
struct Controller {
    guest: Mutex<HashMap<IoReqHandle, Vec<u8>>>,
    completions: Mutex<Sender<(IoReqHandle, Result<()>)>>,
}

impl Controller {
    fn new() -> (Arc<Self>, Receiver<(IoReqHandle, Result<()>)>) {
        let (tx, rx) = mpsc::channel();
        let controller = Arc::new(Self {
            guest: Mutex::new(HashMap::new()),
            completions: Mutex::new(tx),
        });
        (controller, rx)
    }

    fn stage(&self, req: IoReqHandle, data: Vec<u8>) {
        self.guest.lock().unwrap().insert(req, data);
    }

    fn take(&self, req: IoReqHandle) -> Option<Vec<u8>> {
        self.guest.lock().unwrap().remove(&req)
    }
}

impl MediaExPort for Controller {
    fn io_req_copy_from_buf(
        &self,
        req: IoReqHandle,
        _alloc: &mut [u8],
        offset: usize,
        dst: &mut [u8],
    ) -> Result<()> {
        let guest = self.guest.lock().unwrap();
        let src = guest
            .get(&req)
            .and_then(|data| data.get(offset..offset + dst.len()))
            .ok_or_else(|| MediaError::Port("no guest buffer staged".into()))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn io_req_copy_to_buf(
        &self,
        req: IoReqHandle,
        _alloc: &mut [u8],
        offset: usize,
        src: &[u8],
    ) -> Result<()> {
        let mut guest = self.guest.lock().unwrap();
        let data = guest.entry(req).or_default();
        data.resize(offset + src.len(), 0);
        data[offset..].copy_from_slice(src);
        Ok(())
    }

    fn io_req_complete_notify(&self, req: IoReqHandle, _alloc: &mut [u8], result: Result<()>) {
        let _ = self.completions.lock().unwrap().send((req, result));
    }
}

fn sector_data(lba: u64) -> Vec<u8> {
    (0..SECTOR).map(|i| (lba as usize * 31 + i) as u8).collect()
}

fn wait(rx: &Receiver<(IoReqHandle, Result<()>)>) -> (IoReqHandle, Result<()>) {
    rx.recv_timeout(Duration::from_secs(10))
        .expect("completion did not arrive")
}

#[test]
fn guest_io_through_a_file_backed_medium() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guest.img");
    fs::File::create(&path)
        .unwrap()
        .set_len(SECTORS * SECTOR as u64)
        .unwrap();
    let config = MediaConfig {
        path: Some(path.clone()),
        boot_acceleration: true,
        ..MediaConfig::default()
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .build()
        .unwrap();
    let image = open_raw_file(&config, rt.handle().clone()).unwrap();
    let (controller, completions) = Controller::new();
    let driver = MediaDriver::builder(config, Arc::new(image))
        .port(controller.clone())
        .build()
        .unwrap();
    driver.io_req_alloc_size_set(16).unwrap();

    // BIOS phase: synchronous reads through boot acceleration.
    let mut mbr = vec![0u8; SECTOR];
    driver.read(0, &mut mbr).unwrap();
    assert_eq!(mbr, vec![0u8; SECTOR]);
    assert!(driver.is_boot_acceleration_active());

    // Guest driver phase: a queue of writes in flight at once.
    let mut in_flight = HashMap::new();
    for lba in 0..32u64 {
        let req = driver.io_req_alloc(lba, IoReqFlags::empty()).unwrap();
        controller.stage(req, sector_data(lba));
        let status = driver
            .io_req_write(req, lba * SECTOR as u64, SECTOR)
            .unwrap();
        assert_eq!(status, IoStatus::InProgress);
        in_flight.insert(req, lba);
    }
    assert!(!driver.is_boot_acceleration_active());

    while !in_flight.is_empty() {
        let (req, result) = wait(&completions);
        assert_eq!(result, Ok(()));
        assert!(in_flight.remove(&req).is_some());
        controller.take(req);
        driver.io_req_free(req).unwrap();
    }
    assert_eq!(driver.io_req_active_count(), 0);

    // Read everything back, canceling one read on the way.
    let mut reads = HashMap::new();
    for lba in 0..32u64 {
        let id = 1000 + lba;
        let req = driver.io_req_alloc(id, IoReqFlags::empty()).unwrap();
        driver
            .io_req_read(req, lba * SECTOR as u64, SECTOR)
            .unwrap();
        reads.insert(req, lba);
    }
    let canceled = driver.io_req_cancel(1007).is_ok();

    while !reads.is_empty() {
        let (req, result) = wait(&completions);
        let lba = reads.remove(&req).unwrap();
        match result {
            Ok(()) => assert_eq!(controller.take(req).unwrap(), sector_data(lba)),
            Err(MediaError::Canceled) => {
                assert!(canceled);
                assert_eq!(lba, 7);
            }
            Err(err) => panic!("read of sector {lba} failed: {err}"),
        }
        driver.io_req_free(req).unwrap();
    }
    assert_eq!(driver.io_req_active_count(), 0);

    let flush = driver.io_req_alloc(5000, IoReqFlags::empty()).unwrap();
    assert_eq!(driver.io_req_flush(flush).unwrap(), IoStatus::InProgress);
    assert_eq!(wait(&completions), (flush, Ok(())));
    driver.io_req_free(flush).unwrap();

    driver.power_off();
    assert!(!driver.is_mounted());

    let on_disk = fs::read(&path).unwrap();
    for lba in 0..32u64 {
        let start = lba as usize * SECTOR;
        assert_eq!(&on_disk[start..start + SECTOR], &sector_data(lba)[..]);
    }
}
