use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use hls_relay::hls::{manifest::Manifest, rewrite::rewrite_manifest};
use hls_relay::proxy::{codec::ProxyCodec, resolver::Resolver};
use url::Url;

fn media_playlist(segments: usize) -> String {
    let mut text = String::from(
        "#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:1000\n\
         #EXT-X-KEY:METHOD=AES-128,URI=\"keys/k1.key\"\n#EXT-X-MAP:URI=\"init.mp4\"\n",
    );
    for i in 0..segments {
        text.push_str(&format!("#EXTINF:6.000,\nsegment_{i:05}.m4s\n"));
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

fn master_playlist(variants: usize) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-INDEPENDENT-SEGMENTS\n");
    for i in 0..variants {
        text.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION=1280x720,CODECS=\"avc1.64001f,mp4a.40.2\"\n\
             v{i}/index.m3u8\n",
            800_000 * (i + 1)
        ));
    }
    text
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_parse");

    for segments in [10, 100, 1_000] {
        let text = media_playlist(segments);
        group.bench_with_input(BenchmarkId::new("media", segments), &text, |b, text| {
            b.iter(|| Manifest::parse(black_box(text)))
        });
    }

    group.finish();
}

fn bench_rewrite(c: &mut Criterion) {
    let resolver = Resolver::new(["origin.example"], true);
    let codec = ProxyCodec::new("https://relay.example/proxy");
    let final_url = Url::parse("https://origin.example/live/index.m3u8").unwrap();

    let mut group = c.benchmark_group("manifest_rewrite");

    for segments in [10, 100, 1_000] {
        let text = media_playlist(segments);
        group.bench_with_input(BenchmarkId::new("media", segments), &text, |b, text| {
            b.iter(|| rewrite_manifest(black_box(text), &final_url, &resolver, &codec))
        });
    }

    let master = master_playlist(8);
    group.bench_function("master_8_variants", |b| {
        b.iter(|| rewrite_manifest(black_box(&master), &final_url, &resolver, &codec))
    });

    group.finish();
}

criterion_group!(benches, bench_parse, bench_rewrite);
criterion_main!(benches);
