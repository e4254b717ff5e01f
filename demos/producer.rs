//! Example producer (editor side)
//!
//! Creates a channel pair, a payload pool, a camera double buffer and a
//! published scene region, then streams frame updates to the consumer.

use shmlink::{
    deep_copy_to_shared, BuildMode, ChannelConfig, ChannelPair, DoubleBuffer, LinkError, Message,
    Pool, Value,
};
use std::time::{Duration, Instant};

const FRAMES: u64 = 600;
const QUIT: u32 = 0xFFFF;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct Camera {
    frame: u64,
    position: [f32; 3],
    yaw: f32,
}

fn scene() -> Value {
    let meshes: Value = (0..64)
        .map(|i| {
            [
                ("name", Value::from(format!("mesh-{}", i))),
                ("transform", Value::Mat4x3([i as f32; 12])),
                ("visible", Value::Bool(i % 3 != 0)),
            ]
            .into_iter()
            .collect::<Value>()
        })
        .collect();
    [("level", Value::from("demo")), ("meshes", meshes)]
        .into_iter()
        .collect()
}

fn main() {
    let namespace = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "shmlink_demo".to_string());

    println!("[Producer] Starting with namespace: {}", namespace);

    let setup = || -> Result<_, LinkError> {
        let pair = ChannelPair::create(&namespace, ChannelConfig::default())?;
        let pool = Pool::create(&format!("{}.pool", namespace), 1 << 20)?;
        let camera = DoubleBuffer::create(&format!("{}.camera", namespace), &Camera::default())?;
        let region = deep_copy_to_shared(&format!("{}.scene", namespace), &scene(), BuildMode::Fast)?;
        Ok((pair, pool, camera, region))
    };
    let (pair, pool, mut camera, region) = match setup() {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("[Producer] Failed to create objects: {}", e);
            eprintln!("[Producer] A stale run may have left them behind; try another namespace");
            std::process::exit(1);
        }
    };

    println!(
        "[Producer] Scene published: {} nodes, {} bytes",
        region.node_count(),
        region.used()
    );
    println!("[Producer] Waiting for consumer...");
    let hello = pair.receiver().receive();
    println!("[Producer] Consumer connected (request {})", hello.request_id);

    let start = Instant::now();
    let mut pooled = 0u64;
    for frame in 1..=FRAMES {
        camera.write(&Camera {
            frame,
            position: [frame as f32 * 0.1, 1.5, -4.0],
            yaw: (frame % 360) as f32,
        });

        let update: Value = if frame % 60 == 0 {
            pooled += 1;
            scene().with("frame", Value::UInt64(frame)).unwrap_or_default()
        } else {
            [("frame", Value::UInt64(frame))].into_iter().collect()
        };

        loop {
            match pair.sender().send_value(1, 1, frame, &update, Some(&pool)) {
                Ok(()) => break,
                Err(e) if e.is_capacity() => std::thread::sleep(Duration::from_micros(100)),
                Err(e) => {
                    eprintln!("[Producer] Send failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    let elapsed = start.elapsed();
    println!(
        "[Producer] Sent {} frames ({} pooled) in {:.2?}",
        FRAMES, pooled, elapsed
    );

    match pair.request(&Message::inline(0, QUIT, u64::MAX, b"quit"), Some(Duration::from_secs(5))) {
        Ok(Some(reply)) => println!(
            "[Producer] Consumer says: {}",
            String::from_utf8_lossy(match &reply.payload {
                shmlink::Payload::Inline(bytes) => bytes.as_slice(),
                shmlink::Payload::Pooled(_) => &b"<pooled>"[..],
            })
        ),
        Ok(None) => println!("[Producer] No reply from consumer"),
        Err(e) => eprintln!("[Producer] Quit failed: {}", e),
    }

    let stats = pool.stats();
    println!(
        "[Producer] Pool: {} allocations, {} cache hits, {} bytes still in use",
        stats.allocations, stats.cache_hits, stats.bytes_in_use
    );
}
