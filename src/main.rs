use std::sync::Arc;

use tracing::info;

use treesync::data::store::MemStore;
use treesync::utils::{logging, metrics};
use treesync::{
    context, CancelFlag, DataReader, LinkMatrix, LocalStep, Phase, ReaderConfig, Sgd,
    SourceRegistry, SyncGroup,
};

fn main() -> treesync::Result<()> {
    logging::init_logging_from_env();
    info!("starting treesync demo");

    // --- Tree synchronization over four simulated devices ---
    // Devices 0/1 and 2/3 have direct peer links, so pairing joins them
    // first and bridges the two survivors.
    let links = LinkMatrix::new().with_peer(0, 1).with_peer(2, 3);
    let devices = [0, 1, 2, 3];
    let region_sizes = [3usize, 2];

    let group = SyncGroup::new(&devices, &region_sizes, &links, |_| {
        Box::new(Sgd { lr: 0.1 }) as Box<dyn LocalStep>
    })?;
    for worker in group.workers() {
        info!(
            device = worker.device(),
            root = worker.is_root(),
            buffer_len = worker.buffer().len(),
            "worker ready"
        );
    }

    // Each device contributes a constant gradient of (device + 1); the root
    // should step against the mean 2.5 every iteration.
    let params = group.run(5, |device| {
        move |_iter: usize, _data: &mut [f32], diff: &mut [f32]| {
            diff.fill((device + 1) as f32);
        }
    })?;
    info!(?params, "root parameters after five synchronized iterations");

    // --- Deterministic feeding: two consumers over one shared source ---
    let mut store = MemStore::new();
    for i in 0u8..6 {
        store.push(format!("k{i}").into_bytes(), vec![i]);
    }
    let store = Arc::new(store);

    context::set_worker_count(2);
    let registry = SourceRegistry::new();
    let reader_config = ReaderConfig {
        owner: "demo".to_string(),
        source: "mem".to_string(),
        batch_size: 2,
        prefetch: 2,
        phase: Phase::Train,
    };
    let readers = [
        DataReader::new(&registry, &reader_config, store.clone())?,
        DataReader::new(&registry, &reader_config, store)?,
    ];

    let cancel = CancelFlag::new();
    for round in 0..3 {
        for (worker, reader) in readers.iter().enumerate() {
            let record = reader.full().pop(&cancel, "demo consumer")?;
            info!(worker, round, value = record.value()[0], "pulled record");
            reader.free().push(record);
        }
    }

    print!("{}", metrics::global().gather());
    Ok(())
}
