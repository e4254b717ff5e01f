//! Example consumer (engine side)
//!
//! Connects to a running producer, reads the published scene in place and
//! drains frame updates until asked to quit.

use shmlink::{ChannelPair, DoubleBuffer, Message, Pool, SharedRegion, Value};
use std::time::Duration;

const QUIT: u32 = 0xFFFF;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct Camera {
    frame: u64,
    position: [f32; 3],
    yaw: f32,
}

fn main() {
    let namespace = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "shmlink_demo".to_string());

    println!("[Consumer] Connecting to namespace: {}", namespace);

    let connect = || -> shmlink::Result<_> {
        let pair = ChannelPair::connect(&namespace)?;
        let pool = Pool::open(&format!("{}.pool", namespace))?;
        let camera = DoubleBuffer::<Camera>::open(&format!("{}.camera", namespace))?;
        let region = SharedRegion::open(&format!("{}.scene", namespace))?;
        Ok((pair, pool, camera, region))
    };
    let (pair, pool, camera, region) = match connect() {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("[Consumer] Failed to connect: {}", e);
            eprintln!("[Consumer] Make sure the producer is running first!");
            std::process::exit(1);
        }
    };

    // Zero-copy walk of the scene
    match region.root() {
        Ok(root) => {
            let meshes = root.get_key("meshes");
            println!(
                "[Consumer] Scene '{}' with {} meshes",
                root.get_key("level").and_then(|n| n.as_str()).unwrap_or("?"),
                meshes.map_or(0, |m| m.len())
            );
            if let Some(first) = meshes.and_then(|m| m.get(0)) {
                println!(
                    "[Consumer] First mesh: {:?}",
                    first.get_key("name").and_then(|n| n.as_str())
                );
            }
        }
        Err(e) => eprintln!("[Consumer] Scene unreadable: {}", e),
    }

    if let Err(e) = pair.send(&Message::inline(0, 0, 1, b"hello")) {
        eprintln!("[Consumer] Handshake failed: {}", e);
        std::process::exit(1);
    }

    let mut frames = 0u64;
    let mut big = 0u64;
    let mut last_camera = 0u64;
    loop {
        let mut cam = Camera::default();
        if camera.try_read(&mut cam) && cam.frame / 100 != last_camera / 100 {
            println!("[Consumer] Camera frame {} at {:?}", cam.frame, cam.position);
        }
        last_camera = last_camera.max(cam.frame);

        let Some(msg) = pair.try_receive() else {
            std::thread::sleep(Duration::from_micros(50));
            continue;
        };

        if msg.msg_type == QUIT {
            let reply = Message::inline(0, QUIT, msg.request_id, b"bye");
            if let Err(e) = pair.send(&reply) {
                eprintln!("[Consumer] Reply failed: {}", e);
            }
            break;
        }

        match msg.decode_value(Some(&pool)) {
            Ok(value) => {
                frames += 1;
                if value.get("meshes").is_some() {
                    big += 1;
                }
                if frames % 100 == 0 {
                    let frame = value.get("frame").and_then(Value::as_i64).unwrap_or(-1);
                    println!("[Consumer] Update {} (frame {})", msg.request_id, frame);
                }
            }
            Err(e) => eprintln!("[Consumer] Bad update {}: {}", msg.request_id, e),
        }
    }

    println!("[Consumer] Received {} updates ({} full scenes)", frames, big);
}
