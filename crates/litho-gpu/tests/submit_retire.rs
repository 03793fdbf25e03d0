//! Submission-cycle properties: fence ordering, FIFO retirement, finished
//! callbacks, and the no-work fast path.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use litho_gpu::{ColorType, GpuError, MipData, Rect, SyncQueue};

fn upload_solid(
    device: &mut litho_gpu::GpuDevice<litho_gpu::backend::soft::SoftBackend>,
    texture: litho_gpu::TextureId,
    rgba: [u8; 4],
    size: u32,
) {
    let pixels = litho_gpu_utils::solid_rgba8(size, size, rgba);
    device
        .write_pixels(
            texture,
            Rect::from_size(size, size),
            ColorType::Rgba8888,
            &[MipData {
                pixels: &pixels,
                row_bytes: 0,
            }],
        )
        .expect("upload");
}

#[test]
fn fence_values_are_monotonic_and_match_insert_fence() {
    let (mut device, _controller) = common::soft_device();

    let tex = common::rgba_texture(&mut device, 8, 8);
    let mut last = 0;
    for _ in 0..3 {
        upload_solid(&mut device, tex, [1, 2, 3, 4], 8);
        device.submit(SyncQueue::Skip).expect("submit");
        assert!(device.current_fence_value() > last);
        last = device.current_fence_value();
    }

    let inserted = device.insert_fence().expect("insert fence");
    assert_eq!(inserted, last + 1);
    assert_eq!(device.current_fence_value(), inserted);

    device.wait_for_queue_completion().expect("drain");
    assert!(device.wait_fence(inserted));
    device.check_for_finished_command_lists();
    assert_eq!(device.outstanding_submissions(), 0);
}

#[test]
fn three_lists_retire_in_submission_order_with_hooks_firing_once() {
    let (mut device, controller) = common::soft_device();
    controller.pause_queue();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut textures = Vec::new();
    for i in 0..3 {
        let tex = common::rgba_texture(&mut device, 16, 16);
        let order = Arc::clone(&order);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_hook = Arc::clone(&fired);
        device
            .set_finished_hook(
                tex,
                Box::new(move || {
                    fired_in_hook.fetch_add(1, Ordering::SeqCst);
                    order.lock().unwrap().push(i);
                }),
            )
            .expect("install hook");
        textures.push((tex, fired));

        upload_solid(&mut device, tex, [i as u8, 0, 0, 255], 16);
        device.submit(SyncQueue::Skip).expect("submit");
    }

    // Nothing has retired while the queue is held.
    assert_eq!(device.outstanding_submissions(), 3);
    device.check_for_finished_command_lists();
    assert!(order.lock().unwrap().is_empty());
    for (tex, _) in &textures {
        assert!(device.gpu_ref_count(*tex) > 0);
    }

    controller.resume_queue();
    device.wait_for_queue_completion().expect("drain");
    device.check_for_finished_command_lists();

    assert_eq!(device.outstanding_submissions(), 0);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    for (tex, fired) in &textures {
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(device.gpu_ref_count(*tex), 0);
    }
    assert_eq!(device.stats().lists_retired, 3);
}

#[test]
fn empty_submit_skips_queue_and_fires_callbacks_synchronously() {
    let (mut device, controller) = common::soft_device();

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&fired);
    device.add_finished_callback(move || {
        observed.fetch_add(1, Ordering::SeqCst);
    });

    device.submit(SyncQueue::Skip).expect("submit");

    // The callback fired before submit returned, with no queue traffic.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(controller.lists_executed(), 0);
    assert_eq!(device.stats().submissions, 0);
    assert_eq!(device.stats().no_work_submissions, 1);
    assert_eq!(device.current_fence_value(), 0);
}

#[test]
fn callback_on_empty_list_still_waits_for_prior_outstanding_work() {
    let (mut device, controller) = common::soft_device();
    controller.pause_queue();

    let tex = common::rgba_texture(&mut device, 8, 8);
    upload_solid(&mut device, tex, [9, 9, 9, 9], 8);
    device.submit(SyncQueue::Skip).expect("submit work");

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&fired);
    device.add_finished_callback(move || {
        observed.fetch_add(1, Ordering::SeqCst);
    });

    // The empty submission drops its handle immediately, but the callback is
    // also held by the in-flight list, which has not finished.
    device.submit(SyncQueue::Skip).expect("empty submit");
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    controller.resume_queue();
    device.wait_for_queue_completion().expect("drain");
    device.check_for_finished_command_lists();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn destroyed_resource_survives_until_its_list_retires() {
    let (mut device, controller) = common::soft_device();
    controller.pause_queue();

    let tex = common::rgba_texture(&mut device, 8, 8);
    let fired = Arc::new(AtomicUsize::new(0));
    let observed = Arc::clone(&fired);
    device
        .set_finished_hook(tex, Box::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }))
        .expect("install hook");

    upload_solid(&mut device, tex, [5, 5, 5, 5], 8);
    device.submit(SyncQueue::Skip).expect("submit");

    device.destroy_texture(tex).expect("destroy");
    assert!(!device.is_live(tex));
    assert!(device.gpu_ref_count(tex) > 0);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    controller.resume_queue();
    device.wait_for_queue_completion().expect("drain");
    device.check_for_finished_command_lists();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(device.gpu_ref_count(tex), 0);
    assert!(device.destroy_texture(tex).is_err());
}

#[test]
fn device_loss_is_latched_and_fails_fast() {
    let (mut device, controller) = common::soft_device();

    let tex = common::rgba_texture(&mut device, 8, 8);
    upload_solid(&mut device, tex, [1, 1, 1, 1], 8);
    device.submit(SyncQueue::Force).expect("healthy submit");

    controller.inject_device_loss();
    let pixels = litho_gpu_utils::solid_rgba8(8, 8, [2, 2, 2, 2]);
    let err = device
        .write_pixels(
            tex,
            Rect::from_size(8, 8),
            ColorType::Rgba8888,
            &[MipData {
                pixels: &pixels,
                row_bytes: 0,
            }],
        )
        .unwrap_err();
    assert!(matches!(err, GpuError::DeviceLost));
    assert!(device.is_device_lost());

    // Subsequent operations fail before touching the backend.
    let err = device
        .read_pixels(tex, Rect::from_size(8, 8), ColorType::Rgba8888)
        .unwrap_err();
    assert!(matches!(err, GpuError::DeviceLost));
    let err = device.submit(SyncQueue::Skip).unwrap_err();
    assert!(matches!(err, GpuError::DeviceLost));
}

#[test]
fn forced_submit_drains_and_recycles() {
    let (mut device, _controller) = common::soft_device();

    let tex = common::rgba_texture(&mut device, 32, 32);
    for round in 0..4 {
        upload_solid(&mut device, tex, [round as u8, 0, 0, 255], 32);
        device.submit(SyncQueue::Force).expect("submit");
        assert_eq!(device.outstanding_submissions(), 0);
    }
    assert_eq!(device.stats().submissions, 4);
    assert_eq!(device.stats().lists_retired, 4);
}

#[test]
fn semaphore_handoff_between_two_devices() {
    let (mut producer, _pc) = common::soft_device();
    let (mut consumer, _cc) = common::soft_device();

    let semaphore = producer.make_semaphore().expect("make semaphore");
    let imported = consumer.wrap_semaphore(semaphore.clone());

    // Consumer's queue parks until the producer signals.
    consumer.wait_semaphore(&imported, 1).expect("queue wait");

    let tex = common::rgba_texture(&mut producer, 8, 8);
    upload_solid(&mut producer, tex, [3, 3, 3, 3], 8);
    producer.submit(SyncQueue::Skip).expect("submit");
    producer.insert_semaphore(&semaphore, 1).expect("signal");

    let tex2 = common::rgba_texture(&mut consumer, 8, 8);
    upload_solid(&mut consumer, tex2, [4, 4, 4, 4], 8);
    consumer.submit(SyncQueue::Force).expect("consumer submit");

    producer.wait_for_queue_completion().expect("producer drain");
}
