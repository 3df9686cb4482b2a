use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use taplink_core::proto::framing::{encode_frame, read_frame, FrameDecoder, MAX_FRAME_SIZE};
use tokio::runtime::Runtime;

fn framing_benchmark(c: &mut Criterion) {
    let data = vec![0u8; 1500]; // One Ethernet MTU

    c.bench_function("encode_frame", |b| {
        b.iter(|| encode_frame(black_box(&data)).unwrap())
    });

    let mut stream = Vec::new();
    for _ in 0..32 {
        stream.extend(encode_frame(&data).unwrap());
    }

    c.bench_function("decode_32_frames_in_chunks", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut frames = 0;
            for chunk in black_box(&stream).chunks(1024) {
                decoder.push(chunk);
                while decoder.next_frame().unwrap().is_some() {
                    frames += 1;
                }
            }
            frames
        })
    });

    c.bench_function("read_frame_async", |b| {
        b.to_async(Runtime::new().unwrap()).iter_batched(
            || stream.clone(),
            |bytes| async move {
                let mut reader = bytes.as_slice();
                let mut buf = vec![0u8; MAX_FRAME_SIZE];
                while read_frame(&mut reader, &mut buf).await.unwrap().is_some() {}
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, framing_benchmark);
criterion_main!(benches);
