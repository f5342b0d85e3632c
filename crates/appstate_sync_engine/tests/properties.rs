//! Property tests: any patch history converges to the server hash.

mod common;

use appstate_protocol::{Mutation, PatchType};
use appstate_sync_engine::SyncConfig;
use appstate_testkit::{mutation_strategy, sync_key, FakeServer};
use common::Device;
use proptest::prelude::*;
use std::sync::Arc;

fn history_strategy() -> impl Strategy<Value = Vec<Vec<Mutation>>> {
    prop::collection::vec(prop::collection::vec(mutation_strategy(), 1..5), 1..8)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime builds")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn paged_and_snapshot_devices_agree(history in history_strategy(), page_size in 1usize..4) {
        let server = Arc::new(FakeServer::new(sync_key(1)));
        for patch in history.iter().cloned() {
            server.add_remote_patch(PatchType::Regular, patch);
        }
        let expected = server.hash(PatchType::Regular);
        let version = server.version(PatchType::Regular);

        let rt = runtime();

        server.set_snapshot_on_first_sync(false);
        server.set_page_size(page_size);
        let paged = Device::new(&server, SyncConfig::new(), vec![sync_key(1)]);
        let report = rt.block_on(paged.coordinator.pull_patches(&[PatchType::Regular]));
        prop_assert!(report.is_success(), "{:?}", report);

        server.set_snapshot_on_first_sync(true);
        let fresh = Device::new(&server, SyncConfig::new(), vec![sync_key(1)]);
        let report = rt.block_on(fresh.coordinator.pull_patches(&[PatchType::Regular]));
        prop_assert!(report.is_success(), "{:?}", report);

        for device in [&paged, &fresh] {
            let metadata = device.coordinator.metadata(PatchType::Regular).unwrap();
            prop_assert_eq!(metadata.version, version);
            prop_assert_eq!(metadata.hash, expected);
            prop_assert_eq!(
                device.store.mac_table_len(PatchType::Regular),
                server.live_count(PatchType::Regular)
            );
        }
    }
}
