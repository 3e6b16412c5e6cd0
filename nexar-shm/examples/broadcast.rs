//! Pipelined broadcast from rank 3 to 6 in-process ranks.
//!
//! ```bash
//! cargo run --example broadcast
//! ```

use nexar_shm::{DataType, LocalWorld, Locality, ShmConfig, SyntheticTopology, form_shm_comm};

#[tokio::main]
async fn main() -> nexar_shm::Result<()> {
    let world = LocalWorld::new(6, SyntheticTopology::flat().with(Locality::NUMA, 3));
    let config = ShmConfig {
        hierarchy: "numa".into(),
        ..ShmConfig::from_env()
    };
    let root = 3u32;
    let len = 100_000usize;

    let mut handles = Vec::new();
    for host in world.services() {
        let config = config.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let mut comm = form_shm_comm(host, config)?;
            let rank = comm.rank();
            let mut data = if rank == root {
                (0..len).map(|i| (i % 251) as u8).collect()
            } else {
                vec![0u8; len]
            };

            unsafe {
                nexar_shm::hierarchical_broadcast(
                    &mut comm,
                    data.as_mut_ptr() as u64,
                    len,
                    DataType::U8,
                    root,
                )?
            };

            let checksum: u64 = data.iter().map(|&b| b as u64).sum();
            nexar_shm::Result::Ok((rank, checksum))
        }));
    }

    for h in handles {
        let (rank, checksum) = h.await.expect("rank task panicked")?;
        println!("rank {rank}: checksum {checksum}");
    }

    Ok(())
}
