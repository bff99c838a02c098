//! End-to-end scenarios (S1-S6): each spawns one thread per simulated
//! image against `pgas-transport-mem` and drives a full runtime through
//! the public API, the way a real multi-process PGAS program would.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pgas_core::collective;
use pgas_core::config::RuntimeConfig;
use pgas_core::descriptor::{Descriptor, Dim, ElementType};
use pgas_core::error::Stat;
use pgas_core::reference::{self, ArrayRef, ComponentRef, Destination, DimSelect, RefNode};
use pgas_core::runtime::Runtime;
use pgas_core::sync;
use pgas_core::token::TokenKind;
use pgas_core::transfer;
use pgas_core::transport::{LockMode, RmaTransport};
use pgas_transport_mem::{spawn_images, MemTransport};

fn init_runtime(transport: MemTransport) -> Arc<Runtime> {
    Runtime::init(Arc::new(transport), RuntimeConfig::default()).unwrap()
}

fn take2(images: Vec<MemTransport>) -> (MemTransport, MemTransport) {
    let mut it = images.into_iter();
    (it.next().unwrap(), it.next().unwrap())
}

fn take3(images: Vec<MemTransport>) -> (MemTransport, MemTransport, MemTransport) {
    let mut it = images.into_iter();
    (it.next().unwrap(), it.next().unwrap(), it.next().unwrap())
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn to_i32_vec(bytes: &[u8]) -> Vec<i32> {
    bytes.chunks_exact(4).map(|c| i32::from_le_bytes(c.try_into().unwrap())).collect()
}

#[test]
fn s1_contiguous_get_round_trips() {
    let (t1, t2) = take2(spawn_images(2));
    let result = thread::scope(|scope| {
        let h1 = scope.spawn(move || {
            let rt = init_runtime(t1);
            let desc = Descriptor::new(4, ElementType::Integer, 4, &[Dim::unit(1, 10)]).unwrap();
            let token = rt.tokens().register_master(rt.transport().as_ref(), 40, TokenKind::Data, Some(desc.clone())).unwrap();
            let payload = i32_bytes(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
            transfer::send(&rt, token, 0, 1, &desc, &payload, &desc, false, Stat::none()).unwrap();
            rt.transport().barrier().unwrap();
        });
        let h2 = scope.spawn(move || {
            let rt = init_runtime(t2);
            let desc = Descriptor::new(4, ElementType::Integer, 4, &[Dim::unit(1, 10)]).unwrap();
            let token = rt.tokens().register_master(rt.transport().as_ref(), 40, TokenKind::Data, Some(desc.clone())).unwrap();
            rt.transport().barrier().unwrap();
            let mut buf = vec![0u8; 40];
            transfer::get(&rt, token, 0, 1, &mut buf, &desc, &desc, Stat::none()).unwrap();
            to_i32_vec(&buf)
        });
        h1.join().unwrap();
        h2.join().unwrap()
    });
    assert_eq!(result, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
}

#[test]
fn s2_strided_section_get_matches_expected_linear_indices() {
    let (t1, t2) = take2(spawn_images(2));
    let result = thread::scope(|scope| {
        let h1 = scope.spawn(move || {
            let rt = init_runtime(t1);
            // A natural, contiguous 4x4 array: dim 1's stride (4) is the
            // memory multiplier to skip a whole column, not a subscript
            // step.
            let full = Descriptor::new(
                4,
                ElementType::Integer,
                4,
                &[Dim { lower: 1, upper: 4, stride: 1 }, Dim { lower: 1, upper: 4, stride: 4 }],
            )
            .unwrap();
            let token = rt.tokens().register_master(rt.transport().as_ref(), 16, TokenKind::Data, Some(full.clone())).unwrap();
            let values: Vec<i32> = (0..16).collect();
            transfer::send(&rt, token, 0, 1, &full, &i32_bytes(&values), &full, false, Stat::none()).unwrap();
            rt.transport().barrier().unwrap();
        });
        let h2 = scope.spawn(move || {
            let rt = init_runtime(t2);
            let full = Descriptor::new(
                4,
                ElementType::Integer,
                4,
                &[Dim { lower: 1, upper: 4, stride: 1 }, Dim { lower: 1, upper: 4, stride: 4 }],
            )
            .unwrap();
            let token = rt.tokens().register_master(rt.transport().as_ref(), 16, TokenKind::Data, Some(full.clone())).unwrap();
            rt.transport().barrier().unwrap();

            // A 2x2 section taking every other row and every other
            // column: each resolved dim spans 2 positions (bounds give
            // the count directly) at the doubled memory strides (2, 8)
            // needed to reach every second natural row/column.
            let section = Descriptor::new(
                4,
                ElementType::Integer,
                4,
                &[Dim { lower: 1, upper: 2, stride: 2 }, Dim { lower: 1, upper: 2, stride: 8 }],
            )
            .unwrap();
            assert!(!section.is_contiguous());
            assert_eq!(section.element_count(), 4);
            let dest = Descriptor::new(
                4,
                ElementType::Integer,
                4,
                &[Dim { lower: 1, upper: 2, stride: 1 }, Dim { lower: 1, upper: 2, stride: 2 }],
            )
            .unwrap();
            let mut buf = vec![0u8; 16];
            transfer::get(&rt, token, 0, 1, &mut buf, &dest, &section, Stat::none()).unwrap();
            to_i32_vec(&buf)
        });
        h1.join().unwrap();
        h2.join().unwrap()
    });
    // column-major flat index is row + 4*col; the section picks rows
    // {0,2} and columns {0,2} of the natural array, read dim0-fastest.
    assert_eq!(result, vec![0, 2, 8, 10]);
}

#[test]
fn s3_mutex_never_observes_two_distinct_holders() {
    let (t1, t2, t3) = take3(spawn_images(3));
    let released = Arc::new(AtomicBool::new(false));
    thread::scope(|scope| {
        scope.spawn(move || {
            let rt = init_runtime(t1);
            let _token = sync::lock_init(&rt).unwrap();
            rt.transport().barrier().unwrap();
        });

        let released2 = released.clone();
        let holder = scope.spawn(move || {
            let rt = init_runtime(t2);
            let token = sync::lock_init(&rt).unwrap();
            rt.transport().barrier().unwrap();
            sync::lock(&rt, token, 1, Stat::none()).unwrap();
            thread::sleep(Duration::from_millis(20));
            released2.store(true, Ordering::SeqCst);
            sync::unlock(&rt, token, 1, Stat::none()).unwrap();
        });

        let contender = scope.spawn(move || {
            let rt = init_runtime(t3);
            let token = sync::lock_init(&rt).unwrap();
            rt.transport().barrier().unwrap();
            // Head start so this image's first CAS attempt lands while
            // the holder thread above still has the lock.
            thread::sleep(Duration::from_millis(5));
            sync::lock(&rt, token, 1, Stat::none()).unwrap();
            assert!(released.load(Ordering::SeqCst), "acquired the lock before the prior holder released it");
            sync::unlock(&rt, token, 1, Stat::none()).unwrap();
        });

        holder.join().unwrap();
        contender.join().unwrap();
    });
}

#[test]
fn s4_event_wait_unblocks_after_three_posts_then_query_is_zero() {
    let images = spawn_images(4);
    let mut it = images.into_iter();
    let waiter = it.next().unwrap();
    let posters: Vec<MemTransport> = it.collect();

    thread::scope(|scope| {
        let h1 = scope.spawn(move || {
            let rt = init_runtime(waiter);
            let token = sync::event_init(&rt).unwrap();
            rt.transport().barrier().unwrap();
            sync::event_wait(&rt, token, 3, Stat::none()).unwrap();
            sync::event_query(&rt, token, Stat::none()).unwrap()
        });
        for img in posters {
            scope.spawn(move || {
                let rt = init_runtime(img);
                let token = sync::event_init(&rt).unwrap();
                rt.transport().barrier().unwrap();
                sync::event_post(&rt, token, 1, 1, Stat::none()).unwrap();
            });
        }
        let remaining = h1.join().unwrap();
        assert_eq!(remaining, 0);
    });
}

#[test]
fn s5_co_sum_replicated_array_is_elementwise_summed() {
    let images = spawn_images(4);
    thread::scope(|scope| {
        let handles: Vec<_> = images
            .into_iter()
            .map(|img| {
                scope.spawn(move || {
                    let rt = init_runtime(img);
                    let desc = Descriptor::new(4, ElementType::Integer, 4, &[Dim::unit(1, 4)]).unwrap();
                    let mut buf = i32_bytes(&[1, 2, 3, 4]);
                    collective::co_sum(&rt, &mut buf, &desc, None, Stat::none()).unwrap();
                    to_i32_vec(&buf)
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![4, 8, 12, 16]);
        }
    });
}

#[test]
fn s6_get_by_ref_resolves_allocatable_component_into_null_destination() {
    let (t1, t2) = take2(spawn_images(2));
    let result = thread::scope(|scope| {
        let h1 = scope.spawn(move || {
            let rt = init_runtime(t1);
            let root = rt.tokens().register_master(rt.transport().as_ref(), 8, TokenKind::Data, None).unwrap();
            rt.transport().barrier().unwrap();

            // Lay out [descriptor wire bytes][6 x i64 payload] in one
            // dynamic-window allocation, the way an allocatable
            // component's backing memory is described in spec.md §4.E.
            let wire_len = pgas_core::descriptor::wire_max_len();
            let component_desc = Descriptor::new(8, ElementType::Integer, 8, &[Dim::unit(1, 6)])
                .unwrap()
                .with_base_addr(wire_len as i64);
            let wire = component_desc.to_wire();
            let mut payload = vec![0u8; wire_len];
            payload[..wire.len()].copy_from_slice(&wire);
            let values: Vec<i64> = (1..=6).collect();
            payload.extend(values.iter().flat_map(|v| v.to_le_bytes()));

            let slave = rt.tokens().register_slave(rt.transport().as_ref(), payload.len(), None).unwrap();
            let (addr, _) = rt.tokens().lookup_slave(slave).unwrap();
            rt.transport().put_dynamic(rt.this_image(), addr, 0, &payload).unwrap();

            let (root_window, _) = rt.tokens().lookup_master(root).unwrap();
            rt.transport().lock(root_window, rt.this_image(), LockMode::Exclusive).unwrap();
            rt.transport().put(root_window, rt.this_image(), 0, &addr.0.to_le_bytes()).unwrap();
            rt.transport().unlock(root_window, rt.this_image()).unwrap();

            rt.transport().barrier().unwrap();
            rt.transport().barrier().unwrap();
        });

        let h2 = scope.spawn(move || {
            let rt = init_runtime(t2);
            let root = rt.tokens().register_master(rt.transport().as_ref(), 8, TokenKind::Data, None).unwrap();
            rt.transport().barrier().unwrap();
            rt.transport().barrier().unwrap();

            let chain = vec![
                RefNode::Component(ComponentRef { offset: 0, token_offset: 1, item_size: 8 }),
                RefNode::Array(ArrayRef { selects: vec![DimSelect::Full], item_size: 8, static_dims: None }),
            ];
            let mut dest = Destination::null(true);
            reference::get_by_ref(&rt, root, 1, &chain, &mut dest, Stat::none()).unwrap();
            let data = dest.data.unwrap();
            let desc = dest.descriptor.unwrap();
            assert_eq!(desc.element_count(), 6);
            data.chunks_exact(8).map(|c| i64::from_le_bytes(c.try_into().unwrap())).collect::<Vec<_>>()
        });

        h1.join().unwrap();
        h2.join().unwrap()
    });
    assert_eq!(result, vec![1, 2, 3, 4, 5, 6]);
}
