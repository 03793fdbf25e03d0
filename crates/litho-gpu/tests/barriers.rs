//! Barrier coalescing and transition elision, observed through the soft
//! backend's sealed counters.

mod common;

use litho_gpu::{ColorType, MipData, Rect, SyncQueue};

#[test]
fn repeated_same_state_uploads_issue_at_most_one_transition() {
    let (mut device, _controller) = common::soft_device();
    let tex = common::rgba_texture(&mut device, 8, 8);

    // Move the texture out of its creation state so the next upload really
    // needs a transition.
    let pixels = litho_gpu_utils::solid_rgba8(8, 8, [1, 1, 1, 1]);
    device
        .write_pixels(
            tex,
            Rect::from_size(8, 8),
            ColorType::Rgba8888,
            &[MipData {
                pixels: &pixels,
                row_bytes: 0,
            }],
        )
        .expect("seed upload");
    let _ = device
        .read_pixels(tex, Rect::from_size(8, 8), ColorType::Rgba8888)
        .expect("move to copy-source");

    let batches_before = device.backend().sealed_barrier_batches();
    let transitions_before = device.backend().sealed_barrier_transitions();

    // Five uploads all require the copy-destination state; the first records
    // the transition, the rest are elided entirely.
    for i in 0..5u8 {
        let pixels = litho_gpu_utils::solid_rgba8(8, 8, [i, 0, 0, 255]);
        device
            .write_pixels(
                tex,
                Rect::from_size(8, 8),
                ColorType::Rgba8888,
                &[MipData {
                    pixels: &pixels,
                    row_bytes: 0,
                }],
            )
            .expect("upload");
    }
    device.submit(SyncQueue::Force).expect("submit");

    assert_eq!(device.backend().sealed_barrier_batches(), batches_before + 1);
    assert_eq!(
        device.backend().sealed_barrier_transitions(),
        transitions_before + 1
    );
}

#[test]
fn transition_to_creation_state_is_elided() {
    let (mut device, _controller) = common::soft_device();
    let tex = common::rgba_texture(&mut device, 8, 8);

    // Freshly created textures already sit in the copy-destination state.
    let pixels = litho_gpu_utils::solid_rgba8(8, 8, [2, 2, 2, 2]);
    device
        .write_pixels(
            tex,
            Rect::from_size(8, 8),
            ColorType::Rgba8888,
            &[MipData {
                pixels: &pixels,
                row_bytes: 0,
            }],
        )
        .expect("upload");
    device.submit(SyncQueue::Force).expect("submit");

    assert_eq!(device.backend().sealed_barrier_batches(), 0);
    assert_eq!(device.stats().barrier_batches, 0);
}

#[test]
fn distinct_transitions_coalesce_into_one_batch() {
    let (mut device, _controller) = common::soft_device();
    let a = common::rgba_texture(&mut device, 8, 8);
    let b = common::rgba_texture(&mut device, 8, 8);

    // Move both textures to copy-source, then copy a -> b: the recording
    // needs b back in copy-destination and a stays put. All transitions
    // queued between two points of work flush as one barrier submission.
    let _ = device
        .read_pixels(a, Rect::from_size(8, 8), ColorType::Rgba8888)
        .expect("move a");
    let _ = device
        .read_pixels(b, Rect::from_size(8, 8), ColorType::Rgba8888)
        .expect("move b");

    let batches_before = device.backend().sealed_barrier_batches();

    device
        .copy_surface(b, a, Rect::from_size(8, 8), (0, 0))
        .expect("copy");
    device.submit(SyncQueue::Force).expect("submit");

    assert_eq!(device.backend().sealed_barrier_batches(), batches_before + 1);
    // a and b each flipped to copy-source for the readbacks, then b flipped
    // back for the copy.
    assert_eq!(device.stats().barrier_transitions, 3);
}

#[test]
fn stats_track_batches_across_submissions() {
    let (mut device, _controller) = common::soft_device();
    let tex = common::rgba_texture(&mut device, 8, 8);

    for _ in 0..3 {
        // Each round: readback flips to copy-source, upload flips back.
        let pixels = litho_gpu_utils::solid_rgba8(8, 8, [7, 7, 7, 7]);
        device
            .write_pixels(
                tex,
                Rect::from_size(8, 8),
                ColorType::Rgba8888,
                &[MipData {
                    pixels: &pixels,
                    row_bytes: 0,
                }],
            )
            .expect("upload");
        let _ = device
            .read_pixels(tex, Rect::from_size(8, 8), ColorType::Rgba8888)
            .expect("readback");
    }

    // First round's upload needed no transition (creation state); the five
    // remaining flips each sealed one single-transition batch.
    assert_eq!(device.backend().sealed_barrier_batches(), 5);
    assert_eq!(device.backend().sealed_barrier_transitions(), 5);
}
