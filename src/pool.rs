//! 적응형 스레드 풀
//!
//! - 고정 용량 원형 작업 큐 (FIFO)
//! - 최소~최대 사이에서 스스로 크기를 조절하는 워커 스레드
//! - 주기적으로 바쁜 비율을 샘플링하는 매니저 스레드 1개
//!
//! 큐 락과 busy 카운터 락은 분리되어 있다. 작업 실행 중에는 큐 락을 잡지 않는다.
//!
//! 축소는 기회주의적이다: 매니저는 퇴역 요청 수만 올리고 대기 중인 워커를
//! 깨운다. 어떤 워커가 퇴역할지는 먼저 깨어난 쪽이 정한다.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::stats::PoolStats;
use crate::{Error, Result};

/// 큐에 들어가는 작업 단위 (함수 + 캡처된 인자)
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 고정 용량 원형 작업 큐
struct TaskQueue {
    slots: Vec<Option<Task>>,
    front: usize,
    rear: usize,
    size: usize,
}

impl TaskQueue {
    fn with_capacity(capacity: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| Error::AllocationFailed { what: "task queue" })?;
        slots.resize_with(capacity, || None);

        Ok(Self {
            slots,
            front: 0,
            rear: 0,
            size: 0,
        })
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn len(&self) -> usize {
        self.size
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }

    fn is_full(&self) -> bool {
        self.size == self.capacity()
    }

    /// 호출자가 is_full()이 아님을 확인한 뒤 호출
    fn push(&mut self, task: Task) {
        debug_assert!(!self.is_full());
        self.slots[self.rear] = Some(task);
        self.rear = (self.rear + 1) % self.capacity();
        self.size += 1;
    }

    fn pop(&mut self) -> Option<Task> {
        if self.is_empty() {
            return None;
        }
        let task = self.slots[self.front].take();
        self.front = (self.front + 1) % self.capacity();
        self.size -= 1;
        task
    }

    /// 실행되지 않은 작업 폐기, 폐기된 수 반환
    fn clear(&mut self) -> usize {
        let dropped = self.size;
        while self.pop().is_some() {}
        self.front = 0;
        self.rear = 0;
        dropped
    }
}

/// 큐 락으로 보호되는 풀 상태
struct PoolState {
    queue: TaskQueue,
    live_workers: usize,
    pending_retirements: usize,
    shutdown: bool,
}

/// 워커/매니저가 공유하는 내부
struct Shared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    busy_workers: Mutex<usize>,
    queue_not_empty: Condvar,
    queue_not_full: Condvar,
    manager_wakeup: Condvar,
    /// 워커 슬롯 (최대 워커 수만큼). 종료된 스레드의 슬롯은 재사용
    workers: Mutex<Vec<Option<JoinHandle<()>>>>,
}

/// 적응형 스레드 풀 핸들
pub struct ThreadPool {
    shared: Arc<Shared>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPool {
    /// 풀 생성: `min`개의 워커와 매니저 1개 시작
    pub fn new(min_workers: usize, max_workers: usize, queue_capacity: usize) -> Result<Self> {
        Self::with_config(PoolConfig::new(min_workers, max_workers, queue_capacity))
    }

    /// 설정으로 풀 생성
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let queue = TaskQueue::with_capacity(config.queue_capacity)?;

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(config.max_workers)
            .map_err(|_| Error::AllocationFailed { what: "worker slots" })?;
        slots.resize_with(config.max_workers, || None);

        let shared = Arc::new(Shared {
            config: config.clone(),
            state: Mutex::new(PoolState {
                queue,
                live_workers: 0,
                pending_retirements: 0,
                shutdown: false,
            }),
            busy_workers: Mutex::new(0),
            queue_not_empty: Condvar::new(),
            queue_not_full: Condvar::new(),
            manager_wakeup: Condvar::new(),
            workers: Mutex::new(slots),
        });

        if let Err(e) = spawn_workers(&shared, config.min_workers) {
            abort_partial(&shared);
            return Err(e);
        }

        let manager_shared = shared.clone();
        let manager = match thread::Builder::new()
            .name("tmis-pool-manager".into())
            .spawn(move || manager_loop(manager_shared))
        {
            Ok(handle) => handle,
            Err(e) => {
                abort_partial(&shared);
                return Err(Error::SyncInitFailed(format!("매니저 스레드 생성 실패: {}", e)));
            }
        };

        info!(
            "Thread pool created: min={}, max={}, queue={}",
            config.min_workers, config.max_workers, config.queue_capacity
        );

        Ok(Self {
            shared,
            manager: Mutex::new(Some(manager)),
        })
    }

    /// 작업 추가
    ///
    /// 큐가 가득 차 있으면 공간이 생기거나 종료될 때까지 블록된다.
    /// 종료 후에는 블록 없이 `Error::Shutdown` 반환.
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        while state.queue.is_full() && !state.shutdown {
            self.shared.queue_not_full.wait(&mut state);
        }
        if state.shutdown {
            return Err(Error::Shutdown);
        }

        state.queue.push(Box::new(f));
        self.shared.queue_not_empty.notify_one();
        Ok(())
    }

    /// 블록하지 않는 작업 추가. 큐가 가득 차면 `Error::QueueFull`
    pub fn try_submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::Shutdown);
        }
        if state.queue.is_full() {
            return Err(Error::QueueFull);
        }

        state.queue.push(Box::new(f));
        self.shared.queue_not_empty.notify_one();
        Ok(())
    }

    /// 풀 종료
    ///
    /// 새 작업 수락과 큐에서 꺼내기를 멈추고, 실행 중인 작업은 끝날 때까지
    /// 기다린다. 큐에 남은 작업은 실행되지 않고 폐기된다. 여러 번 호출해도 안전.
    /// 풀의 작업 안에서 호출하면 자기 자신은 join하지 않는다.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }

        self.shared.queue_not_empty.notify_all();
        self.shared.queue_not_full.notify_all();
        self.shared.manager_wakeup.notify_all();

        if let Some(manager) = self.manager.lock().take() {
            if manager.join().is_err() {
                warn!("매니저 스레드 비정상 종료");
            }
        }

        join_workers(&self.shared);

        let dropped = self.shared.state.lock().queue.clear();
        info!("Thread pool shut down ({} queued tasks dropped)", dropped);
    }

    /// 종료 여부
    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// 살아있는 워커 수
    pub fn live_workers(&self) -> usize {
        self.shared.state.lock().live_workers
    }

    /// 작업 실행 중인 워커 수
    pub fn busy_workers(&self) -> usize {
        *self.shared.busy_workers.lock()
    }

    /// 현재 상태 스냅샷
    pub fn stats(&self) -> PoolStats {
        let (live_workers, queued_tasks, queue_capacity, pending_retirements, shutdown) = {
            let state = self.shared.state.lock();
            (
                state.live_workers,
                state.queue.len(),
                state.queue.capacity(),
                state.pending_retirements,
                state.shutdown,
            )
        };

        PoolStats {
            min_workers: self.shared.config.min_workers,
            max_workers: self.shared.config.max_workers,
            live_workers,
            busy_workers: self.busy_workers(),
            queued_tasks,
            queue_capacity,
            pending_retirements,
            shutdown,
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 비어있거나 스레드가 이미 끝난 슬롯에 워커를 최대 `count`개 생성
///
/// 추가한 수를 반환한다. live_workers는 max_workers를 넘지 않는다.
fn spawn_workers(shared: &Arc<Shared>, count: usize) -> Result<usize> {
    let mut state = shared.state.lock();
    if state.shutdown {
        return Ok(0);
    }

    let mut workers = shared.workers.lock();
    let mut added = 0;

    for (index, slot) in workers.iter_mut().enumerate() {
        if added >= count || state.live_workers >= shared.config.max_workers {
            break;
        }

        let reusable = match slot {
            None => true,
            Some(handle) => handle.is_finished(),
        };
        if !reusable {
            continue;
        }

        // 끝난 스레드 회수
        if let Some(finished) = slot.take() {
            let _ = finished.join();
        }

        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("tmis-worker-{}", index))
            .spawn(move || worker_loop(worker_shared))
            .map_err(|e| Error::SyncInitFailed(format!("워커 스레드 생성 실패: {}", e)))?;

        *slot = Some(handle);
        state.live_workers += 1;
        added += 1;
    }

    Ok(added)
}

/// 생성 도중 실패 시 이미 띄운 워커 정리
fn abort_partial(shared: &Arc<Shared>) {
    shared.state.lock().shutdown = true;
    shared.queue_not_empty.notify_all();
    join_workers(shared);
}

fn join_workers(shared: &Shared) {
    let current = thread::current().id();
    let handles: Vec<JoinHandle<()>> = shared
        .workers
        .lock()
        .iter_mut()
        .filter_map(Option::take)
        .collect();

    for handle in handles {
        if handle.thread().id() == current {
            continue;
        }
        if handle.join().is_err() {
            warn!("워커 스레드 비정상 종료");
        }
    }
}

/// 워커 루프
fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut state = shared.state.lock();

            while state.queue.is_empty() && !state.shutdown {
                shared.queue_not_empty.wait(&mut state);

                // 퇴역 요청: 먼저 깨어난 유휴 워커가 종료
                if state.pending_retirements > 0 {
                    state.pending_retirements -= 1;
                    if state.live_workers > shared.config.min_workers {
                        state.live_workers -= 1;
                        // 받은 알림이 작업 추가였다면 다른 워커에게 넘긴다
                        if !state.queue.is_empty() {
                            shared.queue_not_empty.notify_one();
                        }
                        debug!("Worker retired: live={}", state.live_workers);
                        return;
                    }
                }
            }

            if state.shutdown {
                state.live_workers = state.live_workers.saturating_sub(1);
                return;
            }

            let task = state.queue.pop();
            shared.queue_not_full.notify_all();
            task
        };

        let Some(task) = task else {
            continue;
        };

        *shared.busy_workers.lock() += 1;
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("작업 실행 중 패닉 발생, 워커는 계속 동작");
        }
        *shared.busy_workers.lock() -= 1;
    }
}

/// 매니저 루프: 주기마다 샘플링 후 확장/축소
fn manager_loop(shared: Arc<Shared>) {
    let interval = shared.config.manager_interval();

    loop {
        {
            let mut state = shared.state.lock();
            let deadline = Instant::now() + interval;
            while !state.shutdown {
                if shared
                    .manager_wakeup
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if state.shutdown {
                break;
            }
        }

        adjust_workers(&shared);
    }

    debug!("Pool manager exiting");
}

fn adjust_workers(shared: &Arc<Shared>) {
    let config = &shared.config;

    let (live, queued) = {
        let state = shared.state.lock();
        (state.live_workers, state.queue.len())
    };
    let busy = *shared.busy_workers.lock();

    let overloaded = if live == 0 {
        queued > 0
    } else {
        busy * 100 / live > config.scale_up_busy_percent
    };

    // 확장
    if overloaded && live < config.max_workers {
        match spawn_workers(shared, config.worker_step) {
            Ok(added) if added > 0 => {
                debug!("Pool scale up: busy={}, live={} -> +{}", busy, live, added);
            }
            Ok(_) => {}
            Err(e) => warn!("워커 추가 실패: {}", e),
        }
    }

    // 축소
    if busy * 2 < live && live > config.min_workers {
        let requested = {
            let mut state = shared.state.lock();
            if state.shutdown {
                return;
            }
            let surplus = state.live_workers.saturating_sub(config.min_workers);
            let requested = config.worker_step.min(surplus);
            state.pending_retirements = (state.pending_retirements + requested).min(surplus);
            requested
        };

        for _ in 0..requested {
            shared.queue_not_empty.notify_one();
        }

        if requested > 0 {
            debug!("Pool scale down: busy={}, live={} -> retire {}", busy, live, requested);
        }
    }
}
