//! Per-loop readiness reactor: one epoll instance plus an eventfd for cross-thread wakeups.
//!
//! Every Loop worker installs its reactor as the thread's current one; channel I/O running on
//! that worker registers interest through [`register`] when a non-blocking call would block.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn flags(self) -> nix::sys::epoll::EpollFlags {
        match self {
            Interest::Readable => nix::sys::epoll::EpollFlags::EPOLLIN | nix::sys::epoll::EpollFlags::EPOLLRDHUP,
            Interest::Writable => nix::sys::epoll::EpollFlags::EPOLLOUT,
        }
    }
}

pub(crate) struct Reactor {
    epoll_fd: std::os::unix::io::RawFd,
    notifier: std::sync::Arc<Notifier>,
    registrations: std::cell::RefCell<std::collections::BTreeMap<std::os::unix::io::RawFd, Registration>>,
}

struct Registration {
    armed: nix::sys::epoll::EpollFlags,
    waker: Option<std::task::Waker>,
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<std::rc::Rc<Reactor>>> = std::cell::RefCell::new(None);
}

impl Reactor {
    pub(crate) fn new() -> nix::Result<Self> {
        let epoll_fd = nix::sys::epoll::epoll_create1(nix::sys::epoll::EpollCreateFlags::EPOLL_CLOEXEC)?;
        let notifier = match Notifier::new() {
            Ok(notifier) => std::sync::Arc::new(notifier),
            Err(err) => {
                let _ = nix::unistd::close(epoll_fd);
                return Err(err);
            },
        };

        let () = nix::sys::epoll::epoll_ctl(
            epoll_fd,
            nix::sys::epoll::EpollOp::EpollCtlAdd,
            notifier.fd,
            Some(&mut nix::sys::epoll::EpollEvent::new(
                nix::sys::epoll::EpollFlags::EPOLLIN,
                notifier.fd as _,
            )),
        )?;

        Ok(Reactor {
            epoll_fd,
            notifier,
            registrations: Default::default(),
        })
    }

    /// Installs this reactor as the current thread's reactor for as long as the thread lives.
    pub(crate) fn install(self: &std::rc::Rc<Self>) {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.clone()));
    }

    /// Drives `future` to completion on the calling thread, parking in epoll while it is pending.
    pub(crate) fn block_on<F>(&self, future: F) -> nix::Result<F::Output>
    where
        F: std::future::Future,
    {
        let mut future = std::pin::pin!(future);

        let task = std::sync::Arc::new(TaskWaker {
            woken: std::sync::atomic::AtomicBool::new(true),
            notifier: self.notifier.clone(),
        });
        let waker = std::task::Waker::from(task.clone());
        let mut cx = std::task::Context::from_waker(&waker);

        loop {
            if task.woken.swap(false, std::sync::atomic::Ordering::AcqRel) {
                if let std::task::Poll::Ready(output) = std::future::Future::poll(future.as_mut(), &mut cx) {
                    return Ok(output);
                }
            }
            else {
                self.turn()?;
            }
        }
    }

    fn turn(&self) -> nix::Result<()> {
        let mut events = [nix::sys::epoll::EpollEvent::empty(); 256];
        let num_events = loop {
            match nix::sys::epoll::epoll_wait(self.epoll_fd, &mut events, -1) {
                Ok(num_events) => break num_events,
                Err(err) if err.as_errno() == Some(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err),
            }
        };

        for event in &events[..num_events] {
            let fd = event.data() as std::os::unix::io::RawFd;

            if fd == self.notifier.fd {
                self.notifier.drain();
                continue;
            }

            let waker = {
                let mut registrations = self.registrations.borrow_mut();
                registrations.get_mut(&fd).and_then(|registration| {
                    registration.armed = nix::sys::epoll::EpollFlags::empty();
                    registration.waker.take()
                })
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        }

        Ok(())
    }

    fn register(&self, fd: std::os::unix::io::RawFd, interest: Interest, waker: &std::task::Waker) -> nix::Result<()> {
        let mut registrations = self.registrations.borrow_mut();

        let (op, armed) = match registrations.get(&fd) {
            Some(registration) => (nix::sys::epoll::EpollOp::EpollCtlMod, registration.armed | interest.flags()),
            None => (nix::sys::epoll::EpollOp::EpollCtlAdd, interest.flags()),
        };

        // Level-triggered one-shot: re-arming an fd that is already ready reports it on the next wait.
        let () = nix::sys::epoll::epoll_ctl(
            self.epoll_fd,
            op,
            fd,
            Some(&mut nix::sys::epoll::EpollEvent::new(
                armed | nix::sys::epoll::EpollFlags::EPOLLONESHOT,
                fd as _,
            )),
        )?;

        registrations.insert(fd, Registration {
            armed,
            waker: Some(waker.clone()),
        });
        Ok(())
    }

    fn deregister(&self, fd: std::os::unix::io::RawFd) -> nix::Result<()> {
        if self.registrations.borrow_mut().remove(&fd).is_none() {
            return Ok(());
        }

        nix::sys::epoll::epoll_ctl(
            self.epoll_fd,
            nix::sys::epoll::EpollOp::EpollCtlDel,
            fd,
            None,
        )
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epoll_fd);
    }
}

/// Registers interest in `fd` with the current thread's reactor, waking `waker` once it is ready.
pub(crate) fn register(fd: std::os::unix::io::RawFd, interest: Interest, waker: &std::task::Waker) -> std::io::Result<()> {
    CURRENT.with(|current| match &*current.borrow() {
        Some(reactor) => reactor.register(fd, interest, waker).map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)),
        None => Err(std::io::Error::new(std::io::ErrorKind::Other, "no reactor is running on this thread")),
    })
}

/// Forgets `fd` if the current thread's reactor knows it. A thread without a reactor has nothing to forget.
pub(crate) fn deregister(fd: std::os::unix::io::RawFd) -> nix::Result<()> {
    CURRENT.with(|current| match &*current.borrow() {
        Some(reactor) => reactor.deregister(fd),
        None => Ok(()),
    })
}

struct Notifier {
    fd: std::os::unix::io::RawFd,
}

impl Notifier {
    fn new() -> nix::Result<Self> {
        let fd = nix::sys::eventfd::eventfd(0, nix::sys::eventfd::EfdFlags::EFD_CLOEXEC | nix::sys::eventfd::EfdFlags::EFD_NONBLOCK)?;
        Ok(Notifier { fd })
    }

    fn notify(&self) {
        // EAGAIN only means the counter is saturated, which still leaves the reactor woken.
        let _ = nix::unistd::write(self.fd, &1_u64.to_ne_bytes());
    }

    fn drain(&self) {
        let mut counter = [0_u8; 8];
        let _ = nix::unistd::read(self.fd, &mut counter);
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.fd);
    }
}

struct TaskWaker {
    woken: std::sync::atomic::AtomicBool,
    notifier: std::sync::Arc<Notifier>,
}

impl std::task::Wake for TaskWaker {
    fn wake(self: std::sync::Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &std::sync::Arc<Self>) {
        if !self.woken.swap(true, std::sync::atomic::Ordering::AcqRel) {
            self.notifier.notify();
        }
    }
}
