use std::time::Instant;

use kindex_core::{Document, ResourceKey, ResourceVersion};
use kindex_search::{IndexEngine, MemIndex, SearchQuery};

fn gen_doc(i: usize, version: i64) -> Document {
    let app = match i % 3 {
        0 => "web",
        1 => "api",
        _ => "batch",
    };
    let name = format!("obj-{i:06}");
    let payload = format!(r#"{{"kind":"ConfigMap","metadata":{{"name":"{name}"}},"data":{{"zone":"zone-{}"}}}}"#, i % 20);
    Document {
        key: ResourceKey::new("", "ConfigMap", &format!("ns{}", i % 10), &name),
        uid: format!("uid-{i}"),
        version: ResourceVersion(version),
        payload: payload.into_bytes(),
        labels: smallvec::smallvec![("app".to_string(), app.to_string()), (format!("team{}", i % 20), "1".to_string())],
        annotations: smallvec::SmallVec::new(),
        creation_ts: 1_577_836_800,
    }
}

fn percentile_us(xs: &mut [u128], p: f64) -> u128 {
    xs.sort_unstable();
    let idx = ((xs.len() as f64 - 1.0) * p).round() as usize;
    xs[idx]
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn main() {
    let n: usize = env_or("KINDEX_BENCH_DOCS", 100_000);
    let limit: usize = env_or("KINDEX_BENCH_LIMIT", 50);
    let iters: usize = env_or("KINDEX_BENCH_ITERS", 200);

    let idx = MemIndex::new();
    eprintln!("indexing {} docs", n);
    let t0 = Instant::now();
    for i in 0..n {
        if let Err(e) = idx.put(gen_doc(i, i as i64 + 1)) {
            eprintln!("put failed: {e}");
            return;
        }
    }
    let put_ms = t0.elapsed().as_secs_f64() * 1_000.0;

    // Modified events: delete then put for a tenth of the docs.
    let t1 = Instant::now();
    let churn = n / 10;
    for i in 0..churn {
        let doc = gen_doc(i, (n + i) as i64 + 1);
        idx.delete(&doc.uid, &doc.key).ok();
        idx.put(doc).ok();
    }
    let churn_ms = t1.elapsed().as_secs_f64() * 1_000.0;

    let queries = ["label:app=web", "ns:ns3 obj-0001", "label:team7 zone", "k:ConfigMap anno:none", "obj-09"];
    println!("docs={} put_ms={:.1} churn={} churn_ms={:.1}", idx.len(), put_ms, churn, churn_ms);
    for q in queries {
        let query = SearchQuery::parse(q).with_limit(limit);
        let mut lat = Vec::with_capacity(iters);
        let mut hits = 0;
        for _ in 0..iters {
            let t = Instant::now();
            match idx.query(&query) {
                Ok(out) => hits = out.hits.len(),
                Err(e) => {
                    eprintln!("query failed: {e}");
                    return;
                }
            }
            lat.push(t.elapsed().as_micros());
        }
        let p50 = percentile_us(&mut lat, 0.50);
        let p99 = percentile_us(&mut lat, 0.99);
        println!("query={:<24} hits={:<4} p50_us={:<8} p99_us={}", q, hits, p50, p99);
    }
}
