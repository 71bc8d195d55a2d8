use crate::{MemBackend, RawDisk, VirtualDisk};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;

#[derive(Debug, Clone)]
enum Op {
    Write { offset: u32, data: Vec<u8> },
    Read { offset: u32, len: usize },
    Flush,
    Reopen,
}

const SECTOR_SIZE: u32 = 512;
const MAX_DISK_SECTORS: u32 = 512;
const MAX_OPS: usize = 48;
const MAX_RW_LEN: usize = 8 * 1024;

fn op_strategy(disk_size: u32) -> BoxedStrategy<Op> {
    let write = (0u32..=disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), prop::collection::vec(any::<u8>(), 0..=max_len))
        })
        .prop_map(|(offset, data)| Op::Write { offset, data });
    let read = (0u32..=disk_size)
        .prop_flat_map(move |offset| {
            let max_len = ((disk_size - offset) as usize).min(MAX_RW_LEN);
            (Just(offset), 0..=max_len)
        })
        .prop_map(|(offset, len)| Op::Read { offset, len });

    prop_oneof![
        4 => write,
        4 => read,
        1 => Just(Op::Flush),
        1 => Just(Op::Reopen),
    ]
    .boxed()
}

fn scenario_strategy() -> impl Strategy<Value = (u32, Vec<Op>)> {
    (1u32..=MAX_DISK_SECTORS)
        .prop_map(|sectors| sectors * SECTOR_SIZE)
        .prop_flat_map(|disk_size| {
            (
                Just(disk_size),
                prop::collection::vec(op_strategy(disk_size), 1..=MAX_OPS),
            )
        })
}

fn run_ops(
    mut disk: RawDisk<MemBackend>,
    mut model: Vec<u8>,
    ops: &[Op],
) -> TestCaseResult {
    for op in ops {
        match op {
            Op::Write { offset, data } => {
                disk.write_at(*offset as u64, data).unwrap();
                let start = *offset as usize;
                model[start..start + data.len()].copy_from_slice(data);
            }
            Op::Read { offset, len } => {
                let mut buf = vec![0u8; *len];
                disk.read_at(*offset as u64, &mut buf).unwrap();
                let start = *offset as usize;
                prop_assert_eq!(&buf[..], &model[start..start + len]);
            }
            Op::Flush => disk.flush().unwrap(),
            Op::Reopen => {
                disk = RawDisk::open(disk.into_backend()).unwrap();
                prop_assert_eq!(disk.capacity_bytes(), model.len() as u64);
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_raw_disk_matches_reference((disk_size, ops) in scenario_strategy()) {
        let disk = RawDisk::create(MemBackend::new(), disk_size as u64).unwrap();
        let model = vec![0u8; disk_size as usize];
        run_ops(disk, model, &ops)?;
    }
}
