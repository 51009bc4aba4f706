//! End-to-end scenarios over in-memory storage: sequential inserts with ring
//! wrap, spline accuracy, variable-data streaming, and bitmap-pruned
//! iteration.

use embeddb::{
    BitmapOps, EmbedDb, EmbedDbConfig, Error, IterQuery, Params, Storage, VarRecord,
};
use embeddb_adapters::MemStorage;

fn mem_storage(cfg: &EmbedDbConfig) -> Storage<MemStorage> {
    let _ = env_logger::builder().is_test(true).try_init();
    Storage {
        data: MemStorage::new(cfg.num_data_pages, cfg.page_size),
        index: cfg
            .params
            .contains(Params::USE_INDEX)
            .then(|| MemStorage::new(cfg.num_index_pages, cfg.page_size)),
        var: cfg
            .params
            .contains(Params::USE_VDATA)
            .then(|| MemStorage::new(cfg.num_var_pages, cfg.page_size)),
    }
}

fn base_config() -> EmbedDbConfig {
    let mut cfg = EmbedDbConfig::new(4, 12);
    cfg.num_data_pages = 32;
    cfg.erase_size_in_pages = 4;
    cfg.num_spline_points = 30;
    cfg.index_max_error = 4;
    cfg
}

fn record(key: u64) -> [u8; 12] {
    let mut data = [0u8; 12];
    data[0] = (key % 100) as u8;
    data
}

#[tokio::test]
async fn sequential_inserts_wrap_the_ring() -> anyhow::Result<()> {
    let cfg = base_config();
    let mut db = EmbedDb::init(cfg.clone(), mem_storage(&cfg)).await?;

    // 31 records per page: 1000 keys fill pages 0..=31 and wrap once.
    for key in 0..1000u64 {
        db.put(key, &record(key)).await?;
    }
    db.flush().await?;

    assert_eq!(db.next_data_page(), 33);
    assert_eq!(db.min_data_page(), 4);

    let mut data = [0u8; 12];
    for key in 0..124u64 {
        assert!(
            matches!(db.get(key, &mut data).await, Err(Error::NotFound)),
            "key {key} should have been displaced by the wrap"
        );
    }
    for key in 124..1000u64 {
        db.get(key, &mut data).await?;
        assert_eq!(data, record(key), "wrong data for key {key}");
    }
    Ok(())
}

#[tokio::test]
async fn spline_estimates_every_key_within_bound() -> anyhow::Result<()> {
    let mut cfg = base_config();
    cfg.index_max_error = 1;
    let mut db = EmbedDb::init(cfg.clone(), mem_storage(&cfg)).await?;

    for key in 0..500u64 {
        db.put(key, &record(key)).await?;
    }
    db.flush().await?;

    for key in 0..500u64 {
        let true_page = (key / 31) as u32;
        let (estimate, low, high) = db.spline_find(key).expect("spline has points");
        let err = (estimate as i64 - true_page as i64).abs();
        assert!(err <= 1, "estimate {estimate} for key {key} on page {true_page}");
        assert!(low <= true_page && true_page <= high);
    }
    Ok(())
}

#[tokio::test]
async fn ring_wrap_keeps_spline_clean() -> anyhow::Result<()> {
    let mut cfg = base_config();
    cfg.index_max_error = 1;
    let mut db = EmbedDb::init(cfg.clone(), mem_storage(&cfg)).await?;

    // Ten full laps of the ring, with slope shifts so the spline commits
    // points regularly.
    let total = 10 * 32 * 31;
    let mut key = 0u64;
    let mut keys = Vec::with_capacity(total);
    for i in 0..total {
        key += 1 + (i as u64 / 311) % 5;
        db.put(key, &record(key)).await?;
        keys.push(key);
    }
    db.flush().await?;

    let next = db.next_data_page();
    let min = db.min_data_page();
    assert_eq!(next, 320);
    let live = next - min;
    assert!(
        (28..=32).contains(&live),
        "expected about num_data_pages - erase_size live pages, got {live}"
    );

    assert!(db.spline_len() >= 2);
    for i in 0..db.spline_len() {
        let (_, page) = db.spline_point(i).unwrap();
        assert!(page >= min, "spline point {i} references reclaimed page {page}");
    }

    // Keys on live pages resolve; reclaimed ones do not.
    let mut data = [0u8; 12];
    let oldest_live = (min as usize) * 31;
    for &k in &keys[oldest_live..oldest_live + 64] {
        db.get(k, &mut data).await?;
    }
    for &k in &keys[..64] {
        assert!(matches!(db.get(k, &mut data).await, Err(Error::NotFound)));
    }
    Ok(())
}

#[tokio::test]
async fn binary_search_mode_finds_the_same_records() -> anyhow::Result<()> {
    let mut cfg = base_config();
    cfg.params |= Params::USE_BINARY_SEARCH;
    let mut db = EmbedDb::init(cfg.clone(), mem_storage(&cfg)).await?;

    for key in 0..500u64 {
        db.put(key * 3, &record(key)).await?;
    }
    db.flush().await?;

    let mut data = [0u8; 12];
    for key in 0..500u64 {
        db.get(key * 3, &mut data).await?;
        assert_eq!(data, record(key));
    }
    // Keys between the stored ones miss.
    assert!(matches!(db.get(4, &mut data).await, Err(Error::NotFound)));
    assert!(matches!(db.get(10_000, &mut data).await, Err(Error::NotFound)));
    Ok(())
}

fn payload(key: u64) -> Vec<u8> {
    (0..1500u64).map(|j| ((key * 31 + j) % 251) as u8).collect()
}

async fn read_stream(
    db: &mut EmbedDb<MemStorage>,
    stream: &mut embeddb::VarDataStream,
) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 128];
    loop {
        let n = db.var_stream_read(stream, &mut chunk).await?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}

#[tokio::test]
async fn variable_data_streams_across_pages_and_wraps() -> anyhow::Result<()> {
    let mut cfg = EmbedDbConfig::new(4, 4);
    cfg.num_data_pages = 32;
    cfg.num_var_pages = 8;
    cfg.erase_size_in_pages = 4;
    cfg.buffer_size_in_blocks = 4;
    cfg.params |= Params::USE_VDATA;
    let mut db = EmbedDb::init(cfg.clone(), mem_storage(&cfg)).await?;

    // Each 1500-byte payload spans several 512-byte pages; the 8-page ring
    // wraps constantly, so read each blob back while it is still live.
    let mut data = [0u8; 4];
    for key in 0..100u64 {
        db.put_var(key, &(key as u32).to_le_bytes(), Some(&payload(key)))
            .await?;

        match db.get_var(key, &mut data).await? {
            VarRecord::Stream(mut stream) => {
                assert_eq!(stream.len(), 1500);
                let bytes = read_stream(&mut db, &mut stream).await?;
                assert_eq!(bytes, payload(key), "stream mismatch for key {key}");
            }
            other => panic!("expected stream for key {key}, got {other:?}"),
        }
    }

    // The ring holds 4096 bytes: early payloads are long gone.
    let oldest_live = db.min_var_key().expect("variable records were written");
    assert!(oldest_live > 0);

    for key in 0..100u64 {
        let result = db.get_var(key, &mut data).await?;
        assert_eq!(u32::from_le_bytes(data), key as u32);
        if key < oldest_live {
            assert!(
                matches!(result, VarRecord::Overwritten),
                "key {key} predates min var key {oldest_live}"
            );
        } else {
            assert!(matches!(result, VarRecord::Stream(_)));
        }
    }
    Ok(())
}

// Bitmap over values 0..100: eight equal buckets of the percent scale.
fn percent_of(data: &[u8]) -> u32 {
    u32::from_le_bytes(data[..4].try_into().unwrap())
}

fn percent_bucket(v: u32) -> u32 {
    (v * 8 / 100).min(7)
}

fn percent_update(data: &[u8], bitmap: &mut [u8]) {
    bitmap[0] |= 1 << percent_bucket(percent_of(data));
}

fn percent_range(min: Option<&[u8]>, max: Option<&[u8]>, bitmap: &mut [u8]) {
    let lo = min.map_or(0, |m| percent_bucket(percent_of(m)));
    let hi = max.map_or(7, |m| percent_bucket(percent_of(m)));
    for b in lo..=hi {
        bitmap[0] |= 1 << b;
    }
}

fn percent_contains(data: &[u8], bitmap: &[u8]) -> bool {
    bitmap[0] & (1 << percent_bucket(percent_of(data))) != 0
}

const PERCENT_BITMAP: BitmapOps = BitmapOps {
    update: percent_update,
    build_range: percent_range,
    contains: percent_contains,
};

#[tokio::test]
async fn bitmap_iterator_skips_unmatched_pages() -> anyhow::Result<()> {
    let mut cfg = EmbedDbConfig::new(4, 4);
    cfg.num_data_pages = 32;
    cfg.num_index_pages = 8;
    cfg.erase_size_in_pages = 4;
    cfg.buffer_size_in_blocks = 4;
    cfg.bitmap_size = 1;
    cfg.params |= Params::USE_INDEX | Params::USE_BITMAP;
    cfg.bitmap = Some(PERCENT_BITMAP);
    let mut db = EmbedDb::init(cfg.clone(), mem_storage(&cfg)).await?;

    // Values climb 0..=99 in runs of ten, so each data page covers a narrow
    // band of the percent scale.
    for i in 0..1000u64 {
        let value = ((i / 10) % 100) as u32;
        db.put(i, &value.to_le_bytes()).await?;
    }
    db.flush().await?;
    let pages_written = db.next_data_page();

    db.reset_stats();
    let query = IterQuery {
        min_data: Some(50u32.to_le_bytes().to_vec()),
        max_data: Some(59u32.to_le_bytes().to_vec()),
        ..IterQuery::default()
    };
    let mut it = db.init_iterator(query);

    let mut key = 0u64;
    let mut data = [0u8; 4];
    let mut found = Vec::new();
    while db.next(&mut it, &mut key, &mut data).await? {
        let value = u32::from_le_bytes(data);
        assert!((50..=59).contains(&value), "value {value} outside the range");
        found.push(key);
    }

    let expected: Vec<u64> = (500..600).collect();
    assert_eq!(found, expected);

    let pages_read = db.stats().num_reads;
    assert!(
        pages_read < pages_written,
        "index pruning read {pages_read} of {pages_written} pages"
    );
    Ok(())
}
