//! Multi-worker channel exchange over the local mock group.

use std::time::Duration;

use braid::{execute_local_mock, Manager, MergeMode};

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Closes every emitter in the vector.
async fn close_all<T: braid::Codec>(emitters: &mut [braid::Emitter<T>]) {
    for emitter in emitters {
        emitter.close().await.unwrap();
    }
}

fn sorted(mut values: Vec<i32>) -> Vec<i32> {
    values.sort_unstable();
    values
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_channels_do_not_error() {
    execute_local_mock(2, |group| async move {
        let manager = Manager::connect(group);
        match manager.my_rank() {
            0 => {
                let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
                let mut emitters = manager.get_network_emitters::<i32>(channel);
                emitters[1].close().await.unwrap();
                emitters[0].close().await.unwrap();
                let iterator = manager.get_iterator::<i32>(channel);
                assert!(!iterator.has_next());
                assert!(iterator.error().is_none());
            }
            _ => {
                sleep_ms(10).await;
                let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
                let iterator = manager.get_iterator::<i32>(channel);
                assert!(!iterator.has_next());
                assert!(iterator.error().is_none());
            }
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finish_requires_all_emitters_closed() {
    execute_local_mock(3, |group| async move {
        let manager = Manager::connect(group);
        let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
        let mut emitters = manager.get_network_emitters::<i32>(channel);

        match manager.my_rank() {
            0 => {
                // Closing a single emitter end is not enough
                emitters[0].close().await.unwrap();
                sleep_ms(50).await;
                assert!(!manager.get_iterator::<i32>(channel).is_finished());
            }
            1 => {
                // Two of three senders closed; worker 2 never sent anything,
                // so its chain stays open and the channel cannot finish
                emitters[0].close().await.unwrap();
                emitters[1].close().await.unwrap();
                sleep_ms(50).await;
                assert!(!manager.get_iterator::<i32>(channel).is_finished());
            }
            _ => {
                sleep_ms(50).await;
            }
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_flush_preserves_single_sender_order() {
    execute_local_mock(2, |group| async move {
        let manager = Manager::connect(group);
        let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
        let mut emitters = manager.get_network_emitters::<i32>(channel);

        if manager.my_rank() == 0 {
            emitters[1].emit(&1).await.unwrap();
            emitters[1].flush().await.unwrap();
            emitters[1].emit(&2).await.unwrap();
            emitters[1].emit(&3).await.unwrap();
            emitters[1].flush().await.unwrap();
            emitters[1].emit(&4).await.unwrap();
            emitters[1].emit(&5).await.unwrap();
            emitters[1].emit(&6).await.unwrap();
            close_all(&mut emitters).await;

            let mut iterator = manager.get_iterator::<i32>(channel);
            assert_eq!(iterator.collect_all().await.unwrap(), Vec::<i32>::new());
            assert!(iterator.is_finished());
        } else {
            close_all(&mut emitters).await;

            let mut iterator = manager.get_iterator::<i32>(channel);
            assert_eq!(iterator.collect_all().await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
            assert!(iterator.is_finished());
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn has_next_only_after_flush() {
    execute_local_mock(2, |group| async move {
        let manager = Manager::connect(group);
        let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();

        if manager.my_rank() == 0 {
            let mut emitters = manager.get_network_emitters::<i32>(channel);
            // Emitted but not flushed: invisible to the peer
            emitters[1].emit(&42).await.unwrap();
            sleep_ms(50).await;

            emitters[1].flush().await.unwrap();
            sleep_ms(50).await;
        } else {
            sleep_ms(20).await;
            let mut iterator = manager.get_iterator::<i32>(channel);
            assert!(!iterator.has_next());

            // The flush makes the element visible within bounded time
            sleep_ms(60).await;
            assert!(iterator.has_next());
            assert_eq!(iterator.next().await.unwrap(), 42);
            assert!(!iterator.has_next());
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reads_data_from_multiple_workers() {
    execute_local_mock(3, |group| async move {
        let manager = Manager::connect(group);
        let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
        let mut emitters = manager.get_network_emitters::<i32>(channel);

        match manager.my_rank() {
            1 => {
                emitters[0].emit(&2).await.unwrap();
                emitters[0].emit(&3).await.unwrap();
            }
            2 => {
                emitters[0].emit(&1).await.unwrap();
                emitters[0].emit(&4).await.unwrap();
            }
            _ => {}
        }
        close_all(&mut emitters).await;

        let mut iterator = manager.get_iterator::<i32>(channel);
        let values = sorted(iterator.collect_all().await.unwrap());
        if manager.my_rank() == 0 {
            assert_eq!(values, vec![1, 2, 3, 4]);
        } else {
            assert_eq!(values, Vec::<i32>::new());
        }
        assert!(iterator.is_finished());
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channels_are_independent() {
    execute_local_mock(3, |group| async move {
        let manager = Manager::connect(group);
        let first = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
        let second = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
        let mut emitters1 = manager.get_network_emitters::<i32>(first);
        let mut emitters2 = manager.get_network_emitters::<i32>(second);

        match manager.my_rank() {
            1 => {
                emitters1[0].emit(&2).await.unwrap();
                emitters1[0].emit(&3).await.unwrap();
                emitters2[0].emit(&5).await.unwrap();
                emitters2[0].emit(&6).await.unwrap();
            }
            2 => {
                emitters1[0].emit(&1).await.unwrap();
                emitters1[0].emit(&4).await.unwrap();
                emitters2[0].emit(&7).await.unwrap();
                emitters2[0].emit(&8).await.unwrap();
            }
            _ => {}
        }
        close_all(&mut emitters1).await;
        close_all(&mut emitters2).await;

        let values1 = sorted(manager.get_iterator::<i32>(first).collect_all().await.unwrap());
        let values2 = sorted(manager.get_iterator::<i32>(second).collect_all().await.unwrap());
        if manager.my_rank() == 0 {
            assert_eq!(values1, vec![1, 2, 3, 4]);
            assert_eq!(values2, vec![5, 6, 7, 8]);
        } else {
            assert!(values1.is_empty());
            assert!(values2.is_empty());
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sends_data_to_every_worker() {
    execute_local_mock(3, |group| async move {
        let manager = Manager::connect(group);
        let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
        let mut emitters = manager.get_network_emitters::<i32>(channel);

        // Worker r sends 10*r + target to each target rank
        let base = 10 * manager.my_rank() as i32;
        for (target, emitter) in emitters.iter_mut().enumerate() {
            emitter.emit(&(base + target as i32)).await.unwrap();
        }
        close_all(&mut emitters).await;

        let mut iterator = manager.get_iterator::<i32>(channel);
        let values = sorted(iterator.collect_all().await.unwrap());
        let me = manager.my_rank() as i32;
        assert_eq!(values, vec![me, 10 + me, 20 + me]);
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn string_elements_cross_the_wire() {
    execute_local_mock(2, |group| async move {
        let manager = Manager::connect(group);
        let channel = manager.allocate_network_channel(MergeMode::Arrival).unwrap();
        let mut emitters = manager.get_network_emitters::<String>(channel);

        let peer = 1 - manager.my_rank();
        emitters[peer]
            .emit(&format!("greetings from {}", manager.my_rank()))
            .await
            .unwrap();
        close_all(&mut emitters).await;

        let mut iterator = manager.get_iterator::<String>(channel);
        let values = iterator.collect_all().await.unwrap();
        assert_eq!(values, vec![format!("greetings from {peer}")]);
        assert!(iterator.is_finished());
    })
    .await;
}
