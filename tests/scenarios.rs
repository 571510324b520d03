//! End-to-end scenarios over in-memory and on-disk corpora.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use ndarray::{Array2, Array3};

use geosample::{
    project_bounds, BoundingBox, Crs, EngineConfig, Error, GeoTiffSource, GeoTransform, MemorySource, PixelWindow,
    Pipeline, PipelineOptions, ResamplingMethod, SampleEngine, SampleError, SamplingPolicy, SourceIoError,
    SourceIoKind, SourceReader, SourceRole, SpatialIndex, TileShape,
};

const UTM: Crs = Crs(32633);

fn tile_config(tile: usize) -> EngineConfig {
    EngineConfig {
        tile_size: TileShape::Square(tile),
        resampling_method_image: ResamplingMethod::Nearest,
        ..EngineConfig::default()
    }
}

fn memory(name: &str, role: SourceRole, data: Array3<f32>, origin: (f64, f64), res: f64) -> (geosample::SourceDescriptor, Arc<dyn SourceReader>) {
    let src = MemorySource::new(name, data);
    let desc = src.descriptor(role, UTM, GeoTransform::new(origin.0, origin.1, res, res));
    (desc, Arc::new(src))
}

/// Counts physical reads and sleeps so concurrent requests overlap.
struct SlowSource {
    inner: MemorySource,
    reads: AtomicUsize,
    delay: Duration,
}

impl SourceReader for SlowSource {
    fn read_window(&self, window: &PixelWindow) -> Result<Array3<f32>, SourceIoError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.inner.read_window(window)
    }

    fn location(&self) -> String {
        "slow://".to_string()
    }
}

#[test]
fn grid_over_100x100_emits_100_tiles_covering_once() {
    let (desc, reader) = memory(
        "scene",
        SourceRole::Image,
        Array3::from_shape_fn((1, 100, 100), |(_, r, c)| (r * 100 + c) as f32),
        (0.0, 100.0),
        1.0,
    );
    let engine = SampleEngine::builder(EngineConfig {
        stride: Some(TileShape::Square(10)),
        num_workers: 3,
        ..tile_config(10)
    })
    .source(desc, reader)
    .build()
    .unwrap();

    let samples: Vec<_> = Pipeline::new(engine).samples().unwrap().map(Result::unwrap).collect();
    assert_eq!(samples.len(), 100);

    let mut hits = Array2::<u32>::zeros((100, 100));
    for s in &samples {
        assert_eq!(s.image.dim(), (1, 10, 10));
        let col0 = s.meta.bbox.minx as usize;
        let row0 = (100.0 - s.meta.bbox.maxy) as usize;
        for r in 0..10 {
            for c in 0..10 {
                hits[(row0 + r, col0 + c)] += 1;
                assert_eq!(s.image[(0, r, c)], ((row0 + r) * 100 + col0 + c) as f32);
            }
        }
    }
    assert!(hits.iter().all(|h| *h == 1));
    // delivered in row-major order despite the worker pool
    assert!(samples.windows(2).all(|w| w[0].meta.seq < w[1].meta.seq));
}

#[test]
fn unreadable_source_fails_each_query_without_stopping() {
    let (desc, _) = memory("missing", SourceRole::Image, Array3::zeros((1, 20, 20)), (0.0, 20.0), 1.0);
    let engine = SampleEngine::builder(EngineConfig {
        num_workers: 2,
        max_consecutive_failures: 100,
        ..tile_config(10)
    })
    .source(desc, Arc::new(GeoTiffSource::new("/nonexistent/missing.tif")))
    .build()
    .unwrap();

    let pipeline = Pipeline::new(engine);
    let mut stream = pipeline.samples().unwrap();
    let outcomes: Vec<_> = stream.by_ref().collect();
    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes {
        match outcome {
            Err(Error::Sample(failure)) => match &failure.error {
                SampleError::SourceIo(io) => assert_eq!(io.kind, SourceIoKind::Open),
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }
    let stats = stream.stats();
    assert_eq!(stats.skipped_source_io, 4);
    assert_eq!(stats.samples_emitted, 0);

    // batching drops every failure and ends cleanly
    let batches: Vec<_> = pipeline.batches().unwrap().collect();
    assert!(batches.is_empty());
}

#[test]
fn consecutive_read_failures_escalate() {
    let (desc, _) = memory("missing", SourceRole::Image, Array3::zeros((1, 40, 40)), (0.0, 40.0), 1.0);
    let engine = SampleEngine::builder(EngineConfig {
        max_consecutive_failures: 3,
        ..tile_config(10)
    })
    .source(desc, Arc::new(GeoTiffSource::new("/nonexistent/missing.tif")))
    .build()
    .unwrap();

    let results: Vec<_> = Pipeline::new(engine).batches().unwrap().collect();
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(Error::TooManyFailures { consecutive: 3, .. })));
}

#[test]
fn sources_in_different_crs_share_output_grid() {
    let target = BoundingBox::new(500_000.0, 5_000_000.0, 500_320.0, 5_000_320.0, UTM);
    let cfg = EngineConfig {
        crs: Some(UTM.0),
        resolution: Some(10.0),
        ..tile_config(32)
    };

    // 5 m UTM raster around the target
    let utm = MemorySource::new("utm", Array3::from_elem((1, 128, 128), 1.0));
    let utm_desc = utm.descriptor(SourceRole::Image, UTM, GeoTransform::new(499_840.0, 5_000_480.0, 5.0, 5.0));

    // geographic raster covering the same ground with a margin
    let geo_bounds = project_bounds(&target, Crs::WGS84).unwrap();
    let res = 0.0001;
    let origin = (geo_bounds.minx - 0.002, geo_bounds.maxy + 0.002);
    let cols = ((geo_bounds.width() + 0.004) / res).ceil() as usize;
    let rows = ((geo_bounds.height() + 0.004) / res).ceil() as usize;
    let geo = MemorySource::new("wgs84", Array3::from_elem((1, rows, cols), 2.0));
    let geo_desc = geo.descriptor(SourceRole::Image, Crs::WGS84, GeoTransform::new(origin.0, origin.1, res, res));

    let a = SampleEngine::builder(cfg.clone()).source(utm_desc, Arc::new(utm)).build().unwrap();
    let b = SampleEngine::builder(cfg).source(geo_desc, Arc::new(geo)).build().unwrap();

    let sa = a.sample(target).unwrap();
    let sb = b.sample(target).unwrap();
    assert_eq!(sa.image.dim(), (1, 32, 32));
    assert_eq!(sa.image.dim(), sb.image.dim());
    assert_eq!(sa.meta.transform, sb.meta.transform);
    assert_eq!(sa.meta.crs, sb.meta.crs);
    assert!(sa.image.iter().all(|v| *v == 1.0));
    assert!(sb.image.iter().all(|v| *v == 2.0));
}

#[test]
fn image_and_label_from_different_crs_are_aligned() {
    let target = BoundingBox::new(500_000.0, 5_000_000.0, 500_160.0, 5_000_160.0, UTM);
    let image = MemorySource::new("img", Array3::from_elem((3, 64, 64), 0.5));
    let image_desc = image.descriptor(SourceRole::Image, UTM, GeoTransform::new(499_920.0, 5_000_240.0, 5.0, 5.0));

    let geo_bounds = project_bounds(&target, Crs::WGS84).unwrap();
    let res = 0.00005;
    let origin = (geo_bounds.minx - 0.001, geo_bounds.maxy + 0.001);
    let cols = ((geo_bounds.width() + 0.002) / res).ceil() as usize;
    let rows = ((geo_bounds.height() + 0.002) / res).ceil() as usize;
    let label = MemorySource::new("lbl", Array3::from_elem((1, rows, cols), 3.0));
    let label_desc = label.descriptor(SourceRole::Label, Crs::WGS84, GeoTransform::new(origin.0, origin.1, res, res));

    let engine = SampleEngine::builder(EngineConfig {
        resampling_method_image: ResamplingMethod::Bilinear,
        resolution: Some(5.0),
        ..tile_config(32)
    })
    .source(image_desc, Arc::new(image))
    .source(label_desc, Arc::new(label))
    .build()
    .unwrap();

    let s = engine.sample(target).unwrap();
    let label = s.label.as_ref().unwrap();
    assert_eq!(label.dim(), (32, 32));
    assert_eq!(s.shape(), label.dim());
    assert!(label.iter().all(|v| *v == 3));
}

#[test]
fn concurrent_identical_reads_coalesce() {
    let slow = Arc::new(SlowSource {
        inner: MemorySource::new("slow", Array3::from_shape_fn((1, 32, 32), |(_, r, c)| (r + c) as f32)),
        reads: AtomicUsize::new(0),
        delay: Duration::from_millis(100),
    });
    let desc = slow
        .inner
        .descriptor(SourceRole::Image, UTM, GeoTransform::new(0.0, 32.0, 1.0, 1.0));
    let engine = SampleEngine::builder(tile_config(8))
        .source(desc, Arc::clone(&slow) as Arc<dyn SourceReader>)
        .build()
        .unwrap();

    let query = engine.query(BoundingBox::new(8.0, 8.0, 16.0, 16.0, UTM));
    let plan = engine.read_windows(&query, SourceRole::Image).unwrap().remove(0);

    let n = 8;
    let barrier = Barrier::new(n);
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..n)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    engine.reader().read(&plan).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(slow.reads.load(Ordering::SeqCst), 1);
    assert_eq!(engine.reader().physical_reads(), 1);
    assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
}

#[test]
fn repeated_reads_are_identical() {
    let (desc, reader) = memory(
        "a",
        SourceRole::Image,
        Array3::from_shape_fn((2, 50, 50), |(b, r, c)| (b as f32).mul_add(0.5, (r * c) as f32 / 7.0)),
        (0.0, 50.0),
        1.0,
    );
    let engine = SampleEngine::builder(EngineConfig {
        resampling_method_image: ResamplingMethod::Cubic,
        ..tile_config(16)
    })
    .source(desc, reader)
    .build()
    .unwrap();

    let bbox = BoundingBox::new(10.0, 10.0, 26.0, 26.0, UTM);
    let first = engine.sample(bbox).unwrap();
    let second = engine.sample(bbox).unwrap();
    assert_eq!(first.image, second.image);
    assert_eq!(engine.reader().physical_reads(), 1);
    assert_eq!(engine.reader().cache_stats().hits, 1);
}

#[test]
fn stratified_frequency_tracks_weights() {
    let (desc, reader) = memory("scene", SourceRole::Image, Array3::zeros((1, 1000, 1000)), (0.0, 1000.0), 1.0);
    let engine = SampleEngine::builder(EngineConfig {
        sampling_policy: SamplingPolicy::Stratified,
        class_weights: [("rare".to_string(), 0.1), ("common".to_string(), 0.9)].into_iter().collect(),
        samples_per_epoch: Some(10_000),
        seed: Some(42),
        ..tile_config(10)
    })
    .source(desc, reader)
    .region("common", BoundingBox::new(100.0, 100.0, 400.0, 400.0, UTM))
    .region("rare", BoundingBox::new(600.0, 600.0, 900.0, 900.0, UTM))
    .build()
    .unwrap();

    let boxes: Vec<_> = engine.sampler().unwrap().collect();
    assert_eq!(boxes.len(), 10_000);
    let common = boxes.iter().filter(|b| b.center().0 < 500.0).count();
    let freq = common as f64 / 10_000.0;
    assert!((freq - 0.9).abs() < 0.012, "common frequency {freq}");
}

#[test]
fn every_footprint_queries_its_own_source() {
    let mut index = SpatialIndex::new(UTM);
    let mut ids = Vec::new();
    for i in 0..20 {
        let x = f64::from(i % 5) * 70.0;
        let y = f64::from(i / 5) * 70.0 + 100.0;
        let (desc, _) = memory(&format!("s{i}"), SourceRole::Image, Array3::zeros((1, 10, 10)), (x, y), 10.0);
        ids.push(index.register(desc).unwrap());
    }
    for id in ids {
        let footprint = *index.footprint(id).unwrap();
        assert!(index.query(&footprint).unwrap().contains(&id));
    }
}

#[test]
fn geotiff_corpus_round_trip() {
    use geosample::{CorpusConfig, GeoTiffWriter};

    let dir = tempfile::tempdir().unwrap();
    let images = dir.path().join("images");
    let labels = dir.path().join("labels");
    std::fs::create_dir_all(&images).unwrap();
    std::fs::create_dir_all(&labels).unwrap();

    let transform = GeoTransform::new(500_000.0, 5_000_400.0, 10.0, 10.0);
    let image = Array3::from_shape_fn((3, 40, 40), |(b, r, c)| (b * 10_000 + r * 40 + c) as f32);
    GeoTiffWriter::new(image.view(), transform, UTM)
        .write(images.join("scene.tif"))
        .unwrap();
    let label = Array3::from_shape_fn((1, 40, 40), |(_, r, c)| ((r / 10) * 4 + c / 10) as f32);
    GeoTiffWriter::new(label.view(), transform, UTM)
        .write(labels.join("scene_label.tif"))
        .unwrap();

    let corpus_path = dir.path().join("corpus.json");
    let corpus = serde_json::json!({
        "engine": {"tile_size": 10, "batch_size": 4, "num_workers": 2,
                   "resampling_method_image": "nearest", "seed": 1},
        "splits": {"train": {"images": [images], "labels": [labels]}}
    });
    std::fs::write(&corpus_path, corpus.to_string()).unwrap();

    let corpus = CorpusConfig::from_path(&corpus_path).unwrap();
    let engine = SampleEngine::for_split(&corpus, "train").unwrap();
    assert_eq!(engine.bands(), 3);
    assert!(engine.has_labels());

    let batches: Vec<_> = Pipeline::new(engine)
        .with_options(PipelineOptions {
            num_workers: 2,
            prefetch: 2,
            max_consecutive_failures: 1,
        })
        .batches()
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(batches.len(), 4);
    for batch in &batches {
        let labels = batch.labels.as_ref().unwrap();
        for (i, meta) in batch.meta.iter().enumerate() {
            // each 10 px tile sits on one label cell
            let row = ((5_000_400.0 - meta.bbox.maxy) / 100.0) as i64;
            let col = ((meta.bbox.minx - 500_000.0) / 100.0) as i64;
            assert!(labels.index_axis(ndarray::Axis(0), i).iter().all(|v| *v == row * 4 + col));
            assert_eq!(meta.source_names, vec!["scene", "scene_label"]);
        }
    }
}
