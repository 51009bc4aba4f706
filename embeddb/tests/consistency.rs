//! Crash and recovery scenarios. `MemStorage` is the crash simulator:
//! closing a database without flushing leaves the devices holding exactly
//! what a power loss would, and reopening over the same devices runs the
//! recovery scans.

use embeddb::{EmbedDb, EmbedDbConfig, Error, Params, Storage};
use embeddb_adapters::MemStorage;

fn rlc_config() -> EmbedDbConfig {
    let mut cfg = EmbedDbConfig::new(4, 12);
    cfg.num_data_pages = 32;
    cfg.erase_size_in_pages = 4;
    cfg.num_spline_points = 30;
    cfg.index_max_error = 4;
    cfg.params |= Params::RECORD_LEVEL_CONSISTENCY;
    cfg
}

fn storage(cfg: &EmbedDbConfig) -> Storage<MemStorage> {
    let _ = env_logger::builder().is_test(true).try_init();
    Storage::data_only(MemStorage::new(cfg.num_data_pages, cfg.page_size))
}

fn record(key: u64) -> [u8; 12] {
    let mut data = [0u8; 12];
    data[0] = (key % 100) as u8;
    data[1] = (key / 100) as u8;
    data
}

async fn expect_all_present(db: &mut EmbedDb<MemStorage>, keys: impl Iterator<Item = u64>) {
    let mut data = [0u8; 12];
    for key in keys {
        db.get(key, &mut data)
            .await
            .unwrap_or_else(|e| panic!("key {key} missing after recovery: {e:?}"));
        assert_eq!(data, record(key), "wrong data for key {key}");
    }
}

#[tokio::test]
async fn rlc_survives_a_crash_without_flush() -> anyhow::Result<()> {
    let cfg = rlc_config();
    let mut db = EmbedDb::init(cfg.clone(), storage(&cfg)).await?;

    for key in 0..=100u64 {
        db.put(key, &record(key)).await?;
    }

    // Crash: drop the engine, keep the medium.
    let medium = db.close();
    let mut db = EmbedDb::init(cfg, medium).await?;

    // Three full pages of 31 records were permanent; the remaining eight
    // records come back from the scratch window.
    assert_eq!(db.next_data_page(), 3);
    expect_all_present(&mut db, 0..=100).await;

    db.put(101, &record(101)).await?;
    assert!(matches!(
        db.put(101, &record(101)).await,
        Err(Error::KeyOrder)
    ));
    expect_all_present(&mut db, 0..=101).await;
    Ok(())
}

#[tokio::test]
async fn rlc_recovery_is_idempotent_at_any_crash_point() -> anyhow::Result<()> {
    const TOTAL: u64 = 150;
    let cfg = rlc_config();

    // Crash-free reference run.
    let mut reference = EmbedDb::init(cfg.clone(), storage(&cfg)).await?;
    for key in 0..TOTAL {
        reference.put(key, &record(key)).await?;
    }

    for crash_at in (5..TOTAL).step_by(13) {
        let mut db = EmbedDb::init(cfg.clone(), storage(&cfg)).await?;
        for key in 0..crash_at {
            db.put(key, &record(key)).await?;
        }

        let medium = db.close();
        let mut db = EmbedDb::init(cfg.clone(), medium).await?;

        for key in crash_at..TOTAL {
            db.put(key, &record(key)).await?;
        }

        // Same observable contents as the crash-free run.
        let mut data = [0u8; 12];
        let mut reference_data = [0u8; 12];
        for key in 0..TOTAL {
            let got = db.get(key, &mut data).await;
            let expected = reference.get(key, &mut reference_data).await;
            match (&got, &expected) {
                (Ok(()), Ok(())) => assert_eq!(data, reference_data),
                (Err(Error::NotFound), Err(Error::NotFound)) => {}
                _ => panic!(
                    "crash at {crash_at}: key {key} diverged: {got:?} vs {expected:?}"
                ),
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn rlc_recovers_before_any_permanent_page() -> anyhow::Result<()> {
    let cfg = rlc_config();
    let mut db = EmbedDb::init(cfg.clone(), storage(&cfg)).await?;

    for key in 0..5u64 {
        db.put(key, &record(key)).await?;
    }

    let medium = db.close();

    // The temporary copies live in the scratch window starting at the
    // second erase block, never at physical page 0.
    assert!(medium.data.page(0).iter().all(|&b| b == 0xFF));
    let first_scratch = medium.data.page(cfg.erase_size_in_pages);
    assert_eq!(first_scratch[..4], 0u32.to_le_bytes());

    let mut db = EmbedDb::init(cfg.clone(), medium).await?;
    assert_eq!(db.next_data_page(), 0);
    expect_all_present(&mut db, 0..5).await;

    // Keep going across the first permanent page and a window shift.
    for key in 5..40u64 {
        db.put(key, &record(key)).await?;
    }
    let medium = db.close();
    let mut db = EmbedDb::init(cfg, medium).await?;
    expect_all_present(&mut db, 0..40).await;
    Ok(())
}

#[tokio::test]
async fn plain_reopen_restores_flushed_state() -> anyhow::Result<()> {
    let mut cfg = EmbedDbConfig::new(4, 12);
    cfg.num_data_pages = 32;
    cfg.erase_size_in_pages = 4;
    let mut db = EmbedDb::init(cfg.clone(), storage(&cfg)).await?;

    for key in 0..200u64 {
        db.put(key, &record(key)).await?;
    }
    db.flush().await?;
    // A few unflushed records that a crash will lose.
    for key in 200..210u64 {
        db.put(key, &record(key)).await?;
    }

    let medium = db.close();
    let mut db = EmbedDb::init(cfg, medium).await?;

    expect_all_present(&mut db, 0..200).await;
    let mut data = [0u8; 12];
    for key in 200..210u64 {
        assert!(matches!(db.get(key, &mut data).await, Err(Error::NotFound)));
    }

    // The log tail was found: inserts continue monotonically.
    assert!(matches!(
        db.put(150, &record(150)).await,
        Err(Error::KeyOrder)
    ));
    db.put(300, &record(300)).await?;
    db.flush().await?;
    db.get(300, &mut data).await?;
    Ok(())
}

#[tokio::test]
async fn reopen_after_ring_wrap_finds_the_tail() -> anyhow::Result<()> {
    let mut cfg = EmbedDbConfig::new(4, 12);
    cfg.num_data_pages = 32;
    cfg.erase_size_in_pages = 4;
    let mut db = EmbedDb::init(cfg.clone(), storage(&cfg)).await?;

    for key in 0..2000u64 {
        db.put(key, &record(key)).await?;
    }
    db.flush().await?;
    let next_before = db.next_data_page();
    let min_before = db.min_data_page();
    assert!(min_before > 0, "the ring should have wrapped");

    let medium = db.close();
    let mut db = EmbedDb::init(cfg, medium).await?;

    assert_eq!(db.next_data_page(), next_before);
    assert_eq!(db.min_data_page(), min_before);

    let oldest_live = u64::from(min_before) * 31;
    expect_all_present(&mut db, oldest_live..2000).await;
    let mut data = [0u8; 12];
    for key in (0..oldest_live).step_by(97) {
        assert!(matches!(db.get(key, &mut data).await, Err(Error::NotFound)));
    }

    db.put(5000, &record(5000)).await?;
    db.flush().await?;
    db.get(5000, &mut data).await?;
    Ok(())
}
