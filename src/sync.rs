// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Lock wrappers that treat poisoning as unrecoverable.
//!
//! A panic while a registry lock is held means the resource graph is in an unknown state, and the
//! only safe thing left to do is to take the host down. These wrappers save every caller from
//! spelling that out.

use std::sync::Condvar as StdCondvar;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::RwLock as StdRwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;
use std::time::Duration;

const POISONED: &str = "lock is poisoned";

/// A mutual exclusion primitive whose `lock` never returns an error.
#[derive(Debug, Default)]
pub struct Mutex<T: ?Sized> {
    std: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            std: StdMutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        match self.std.into_inner() {
            Ok(value) => value,
            Err(_) => panic!("{}", POISONED),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.std.lock() {
            Ok(guard) => guard,
            Err(_) => panic!("{}", POISONED),
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        match self.std.get_mut() {
            Ok(value) => value,
            Err(_) => panic!("{}", POISONED),
        }
    }
}

/// A reader-writer lock whose guards never return an error.
#[derive(Debug, Default)]
pub struct RwLock<T: ?Sized> {
    std: StdRwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> RwLock<T> {
        RwLock {
            std: StdRwLock::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        match self.std.read() {
            Ok(guard) => guard,
            Err(_) => panic!("{}", POISONED),
        }
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        match self.std.write() {
            Ok(guard) => guard,
            Err(_) => panic!("{}", POISONED),
        }
    }
}

/// A condition variable paired with [`Mutex`].
#[derive(Debug, Default)]
pub struct Condvar {
    std: StdCondvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            std: StdCondvar::new(),
        }
    }

    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        match self.std.wait(guard) {
            Ok(guard) => guard,
            Err(_) => panic!("{}", POISONED),
        }
    }

    pub fn wait_while<'a, T, F>(&self, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        match self.std.wait_while(guard, condition) {
            Ok(guard) => guard,
            Err(_) => panic!("{}", POISONED),
        }
    }

    /// Waits at most `timeout`; returns the guard and whether the wait timed out.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, bool) {
        match self.std.wait_timeout(guard, timeout) {
            Ok((guard, result)) => (guard, result.timed_out()),
            Err(_) => panic!("{}", POISONED),
        }
    }

    pub fn notify_one(&self) {
        self.std.notify_one()
    }

    pub fn notify_all(&self) {
        self.std.notify_all()
    }
}
