//! Interrupt-driven, fully-debounced push buttons.
//!
//! Mechanical push-buttons bounce: a single press produces a burst of
//! electrical transitions before the contacts settle.  This crate keeps
//! a fixed registry of [`embedded-hal`][0] input lines, each wired to a
//! momentary button, and turns the raw edges on those lines into a
//! stable pressed/released state plus a "changed since you last looked"
//! flag per button.
//!
//! Nothing here polls.  The registry is driven by edge interrupts, so
//! your main loop pays nothing while the buttons sit idle.
//!
//! # Usage
//!
//! You need to bring a few things:
//!
//! - A [`ButtonLine`](ButtonLine) per button.  That's an `InputPin`,
//!   perhaps from the HAL for your chip, plus the ability to enable
//!   the pull-up and to arm and disarm a both-edges interrupt.
//! - A millisecond [`Clock`](Clock).  Any `Fn() -> Millis` will do.
//! - A blocking delay, used once while the pull-ups settle.
//! - An interrupt handler that calls [`on_edge()`](Buttons#method.on_edge).
//!   Every line may share the same handler: each call rescans all of
//!   the lines, so it doesn't matter which one fired.
//!
//! ## Create the registry.
//!
//! The registry is usually a `static`, shared between the interrupt
//! handler and your application code:
//!
//! ```
//! # struct PinType;
//! # impl embedded_hal::digital::v2::InputPin for PinType {
//! #     type Error = core::convert::Infallible;
//! #     fn is_high(&self) -> Result<bool, Self::Error> {
//! #         Ok(true)
//! #     }
//! #     fn is_low(&self) -> Result<bool, Self::Error> {
//! #         Ok(false)
//! #     }
//! # }
//! # impl edgebounce::ButtonLine for PinType {
//! #     fn configure_input(&mut self) {}
//! #     fn arm_edge_interrupt(&mut self) {}
//! #     fn disarm_edge_interrupt(&mut self) {}
//! # }
//! # fn millis() -> edgebounce::Millis { 0 }
//! use edgebounce::{default::ActiveLow, Buttons, Millis};
//! static BUTTONS: Buttons<PinType, fn() -> Millis, ActiveLow, 4> =
//!     Buttons::new(millis as fn() -> Millis);
//! ```
//!
//! ## Start it.
//!
//! Hand over the lines.  Their order fixes the button ids used by the
//! accessors: the first line is button `0`, and so on.
//!
//! ```
//! # struct PinType;
//! # impl embedded_hal::digital::v2::InputPin for PinType {
//! #     type Error = core::convert::Infallible;
//! #     fn is_high(&self) -> Result<bool, Self::Error> {
//! #         Ok(true)
//! #     }
//! #     fn is_low(&self) -> Result<bool, Self::Error> {
//! #         Ok(false)
//! #     }
//! # }
//! # impl edgebounce::ButtonLine for PinType {
//! #     fn configure_input(&mut self) {}
//! #     fn arm_edge_interrupt(&mut self) {}
//! #     fn disarm_edge_interrupt(&mut self) {}
//! # }
//! # struct Delay;
//! # impl embedded_hal::blocking::delay::DelayMs<u32> for Delay {
//! #     fn delay_ms(&mut self, _ms: u32) {}
//! # }
//! # fn millis() -> edgebounce::Millis { 0 }
//! # use edgebounce::{default::ActiveLow, Buttons, Millis};
//! # static BUTTONS: Buttons<PinType, fn() -> Millis, ActiveLow, 4> =
//! #     Buttons::new(millis as fn() -> Millis);
//! unsafe { BUTTONS.start([PinType, PinType], &mut Delay) }.unwrap();
//! assert_eq!(2, BUTTONS.number_of_buttons());
//! ```
//!
//! See the docs on [`start()`](Buttons#method.start) for the safety
//! details.
//!
//! ## Service the interrupt, read the buttons.
//!
//! ```
//! # struct PinType;
//! # impl embedded_hal::digital::v2::InputPin for PinType {
//! #     type Error = core::convert::Infallible;
//! #     fn is_high(&self) -> Result<bool, Self::Error> {
//! #         Ok(true)
//! #     }
//! #     fn is_low(&self) -> Result<bool, Self::Error> {
//! #         Ok(false)
//! #     }
//! # }
//! # impl edgebounce::ButtonLine for PinType {
//! #     fn configure_input(&mut self) {}
//! #     fn arm_edge_interrupt(&mut self) {}
//! #     fn disarm_edge_interrupt(&mut self) {}
//! # }
//! # struct Delay;
//! # impl embedded_hal::blocking::delay::DelayMs<u32> for Delay {
//! #     fn delay_ms(&mut self, _ms: u32) {}
//! # }
//! # fn millis() -> edgebounce::Millis { 0 }
//! # use edgebounce::{default::ActiveLow, Buttons, Millis};
//! # static BUTTONS: Buttons<PinType, fn() -> Millis, ActiveLow, 4> =
//! #     Buttons::new(millis as fn() -> Millis);
//! # unsafe { BUTTONS.start([PinType, PinType], &mut Delay) }.unwrap();
//! // In the edge interrupt handler:
//! unsafe { BUTTONS.on_edge() }.unwrap();
//!
//! // Anywhere in application code:
//! if BUTTONS.clicked(0, true) {
//!     // button 0 went down since we last asked
//! }
//! ```
//!
//! The accessors are safe to call at any time, even before `start()`;
//! they simply answer `false` until the registry is running.
//!
//! # Debouncing
//!
//! A raw reading that differs from the debounced state is only accepted
//! if more than [`Debounce::DELAY_MS`](Debounce#associatedconstant.DELAY_MS)
//! milliseconds have passed since the *previous* differing reading.  A
//! line that keeps chattering never gets promoted; it has to go quiet
//! for a full window first.
//!
//! [0]: https://github.com/rust-embedded/embedded-hal

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{compiler_fence, AtomicBool, AtomicU32, AtomicUsize, Ordering};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::digital::v2::InputPin;
use heapless::Vec;

/// A timestamp or duration in milliseconds.
///
/// Timestamps wrap around at `u32::MAX`; all comparisons are done on
/// wrapping differences.
pub type Millis = u32;

/// The debounce window used by the [`default`](default) configurations.
pub const DEBOUNCE_DELAY_MS: Millis = 50;

/// How long [`start()`](Buttons#method.start) waits between enabling
/// the pull-ups and arming the interrupts.
///
/// Arm too early and the line is still rising, which shows up as a
/// phantom edge.
pub const SETTLE_DELAY_MS: u32 = 10;

/// Static configuration of the debouncing algorithm.
pub trait Debounce {
    /// Minimum quiet time before a new reading is accepted.
    ///
    /// A differing reading is accepted only if strictly more than this
    /// many milliseconds have passed since the last differing reading.
    const DELAY_MS: Millis;

    /// Electrical polarity of the buttons.
    ///
    /// If `ACTIVE_LOW` is true, a button reads as pressed when its line
    /// is low (idle high through a pull-up).  Otherwise a high line
    /// means pressed.
    const ACTIVE_LOW: bool;
}

/// Some default configurations.
///
/// Both use a [`DEBOUNCE_DELAY_MS`](crate::DEBOUNCE_DELAY_MS) window,
/// which suits most tactile switches.
pub mod default {
    use crate::{Millis, DEBOUNCE_DELAY_MS};

    /// Buttons that pull the line to ground against a pull-up.
    pub struct ActiveLow;

    impl super::Debounce for ActiveLow {
        const DELAY_MS: Millis = DEBOUNCE_DELAY_MS;

        const ACTIVE_LOW: bool = true;
    }

    /// Buttons that drive the line high against a pull-down.
    pub struct ActiveHigh;

    impl super::Debounce for ActiveHigh {
        const DELAY_MS: Millis = DEBOUNCE_DELAY_MS;

        const ACTIVE_LOW: bool = false;
    }
}

/// A monotonic millisecond counter.
///
/// The counter may wrap around; the debouncer only ever looks at the
/// difference between two readings.
pub trait Clock {
    /// The current time.
    fn now_ms(&self) -> Millis;
}

impl<F: Fn() -> Millis> Clock for F {
    #[inline(always)]
    fn now_ms(&self) -> Millis {
        self()
    }
}

/// An input line with a button attached.
///
/// Beyond reading the level, the registry needs to configure the line
/// and to switch its edge interrupt on and off.  The interrupt must
/// fire on both edges and end up calling
/// [`on_edge()`](Buttons#method.on_edge).
pub trait ButtonLine: InputPin {
    /// Configure the line as an input.
    ///
    /// For [`ActiveLow`](default::ActiveLow) buttons this should enable
    /// the internal pull-up.
    fn configure_input(&mut self);

    /// Enable the both-edges interrupt for this line.
    fn arm_edge_interrupt(&mut self);

    /// Disable the interrupt for this line.
    fn disarm_edge_interrupt(&mut self);
}

/// An error that arose while starting the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StartError {
    /// No lines were supplied.
    InvalidInput,

    /// More lines were supplied than the registry has room for.
    AllocationFailure,
}

/// An error that arose while handling an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EdgeError<LineError> {
    /// The registry was not started.
    NotStarted,

    /// Reading a line failed.
    ///
    /// Only the first failure is reported; the other lines are still
    /// processed.
    Line {
        /// Id of the button whose line failed.
        index: usize,
        /// The error from the line.
        error: LineError,
    },
}

/// Debounce state of a single button.
///
/// The edge handler is the only writer of `current_state` and
/// `last_change` and the only one to set `change_flag`.  Application
/// code only ever clears `change_flag`.
struct ButtonEntry {
    current_state: AtomicBool,
    change_flag: AtomicBool,
    last_change: AtomicU32,
}

impl ButtonEntry {
    #[allow(clippy::declare_interior_mutable_const)]
    const IDLE: ButtonEntry = ButtonEntry::new();

    const fn new() -> Self {
        ButtonEntry {
            current_state: AtomicBool::new(false),
            change_flag: AtomicBool::new(false),
            last_change: AtomicU32::new(0),
        }
    }

    fn reset(&self) {
        self.current_state.store(false, Ordering::Relaxed);
        self.change_flag.store(false, Ordering::Relaxed);
        self.last_change.store(0, Ordering::Relaxed);
    }

    /// Feed in a raw reading, returning whether it was accepted.
    #[inline(always)]
    fn observe(&self, pressed: bool, now: Millis, delay: Millis) -> bool {
        if pressed == self.current_state.load(Ordering::Relaxed) {
            return false;
        }

        let last = self.last_change.load(Ordering::Relaxed);
        let accepted = now.wrapping_sub(last) > delay;
        if accepted {
            self.current_state.store(pressed, Ordering::Relaxed);
            self.change_flag.store(true, Ordering::Release);
        }

        // Every divergence restarts the quiet window, accepted or not.
        self.last_change.store(now, Ordering::Relaxed);

        accepted
    }

    #[inline(always)]
    fn pressed(&self) -> bool {
        self.current_state.load(Ordering::Relaxed)
    }

    /// Read the change flag, optionally clearing it.
    ///
    /// The flag is only written back when it was seen set, so a change
    /// flagged by the edge handler between the load and the store is
    /// never lost.
    #[inline(always)]
    fn take_change(&self, clear: bool) -> bool {
        let changed = self.change_flag.load(Ordering::Acquire);
        if clear && changed {
            self.change_flag.store(false, Ordering::Relaxed);
        }
        changed
    }
}

/// A registry of debounced push-buttons.
///
/// Since this needs to be shared between the main application code and
/// the interrupt service routine, it is generally put into a static.
/// `N` is the most lines it can hold; `start()` takes anywhere from one
/// to `N` of them.
///
/// ```
/// # struct PinType;
/// # impl embedded_hal::digital::v2::InputPin for PinType {
/// #     type Error = core::convert::Infallible;
/// #     fn is_high(&self) -> Result<bool, Self::Error> {
/// #         Ok(true)
/// #     }
/// #     fn is_low(&self) -> Result<bool, Self::Error> {
/// #         Ok(false)
/// #     }
/// # }
/// # fn millis() -> edgebounce::Millis { 0 }
/// use edgebounce::{default::ActiveLow, Buttons, Millis};
/// static BUTTONS: Buttons<PinType, fn() -> Millis, ActiveLow, 8> =
///     Buttons::new(millis as fn() -> Millis);
///
/// // Nothing is running yet, so nothing is pressed.
/// assert_eq!(0, BUTTONS.number_of_buttons());
/// assert!(!BUTTONS.down(0, false));
/// ```
pub struct Buttons<Line, Clk, Cfg, const N: usize> {
    cfg: PhantomData<Cfg>,
    clock: Clk,
    begun: AtomicBool,
    count: AtomicUsize,
    lines: UnsafeCell<Vec<Line, N>>,
    entries: [ButtonEntry; N],
}

// The line storage is only mutated by `start()` and `stop()`, which the
// caller promises never overlap with `on_edge()`.  Everything else is
// atomic.  Lines may be handed back by `stop()` in another context, and
// the clock is read from the interrupt handler.
unsafe impl<Line: Send, Clk: Sync, Cfg, const N: usize> Sync for Buttons<Line, Clk, Cfg, N> {}

impl<Line, Clk, Cfg, const N: usize> Buttons<Line, Clk, Cfg, N> {
    /// Create a new, stopped registry.
    pub const fn new(clock: Clk) -> Self {
        Buttons {
            cfg: PhantomData,
            clock,
            begun: AtomicBool::new(false),
            count: AtomicUsize::new(0),
            lines: UnsafeCell::new(Vec::new()),
            entries: [ButtonEntry::IDLE; N],
        }
    }

    /// The number of buttons being monitored, or zero if the registry
    /// is not running.
    #[inline]
    pub fn number_of_buttons(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Has the user "clicked" the button?
    ///
    /// That is, is the button down with its change flag set.  If
    /// `clear_change_flag` is true the flag is cleared, once, whatever
    /// the answer.
    ///
    /// Returns `false` if the registry is not running.
    ///
    /// # Panics
    ///
    /// Panics if the registry is running and `button_id` is not less
    /// than [`number_of_buttons()`](#method.number_of_buttons).
    #[inline]
    pub fn clicked(&self, button_id: usize, clear_change_flag: bool) -> bool {
        // The flag must be captured before anything clears it.
        self.changed(button_id, clear_change_flag) && self.down(button_id, false)
    }

    /// Has the user "released" the button?
    ///
    /// That is, is the button up with its change flag set.  If
    /// `clear_change_flag` is true the flag is cleared, once, whatever
    /// the answer.
    ///
    /// Returns `false` if the registry is not running.
    ///
    /// # Panics
    ///
    /// Panics if the registry is running and `button_id` is out of
    /// range.
    #[inline]
    pub fn released(&self, button_id: usize, clear_change_flag: bool) -> bool {
        self.changed(button_id, clear_change_flag) && self.up(button_id, false)
    }

    /// Is the button currently held down?
    ///
    /// If `clear_change_flag` is true the change flag is cleared as a
    /// side effect.  Returns `false` if the registry is not running.
    ///
    /// # Panics
    ///
    /// Panics if the registry is running and `button_id` is out of
    /// range.
    #[inline]
    pub fn down(&self, button_id: usize, clear_change_flag: bool) -> bool {
        match self.entry(button_id) {
            Some(entry) => {
                entry.take_change(clear_change_flag);
                entry.pressed()
            }
            None => false,
        }
    }

    /// Is the button currently up?
    ///
    /// If `clear_change_flag` is true the change flag is cleared as a
    /// side effect.  Returns `false` if the registry is not running.
    ///
    /// # Panics
    ///
    /// Panics if the registry is running and `button_id` is out of
    /// range.
    #[inline]
    pub fn up(&self, button_id: usize, clear_change_flag: bool) -> bool {
        match self.entry(button_id) {
            Some(entry) => {
                entry.take_change(clear_change_flag);
                !entry.pressed()
            }
            None => false,
        }
    }

    /// Has the button changed state since its change flag was last
    /// cleared?
    ///
    /// The answer reflects the flag as it was on entry; if
    /// `clear_change_flag` is true it is cleared afterwards.  Returns
    /// `false` if the registry is not running.
    ///
    /// # Panics
    ///
    /// Panics if the registry is running and `button_id` is out of
    /// range.
    #[inline]
    pub fn changed(&self, button_id: usize, clear_change_flag: bool) -> bool {
        match self.entry(button_id) {
            Some(entry) => entry.take_change(clear_change_flag),
            None => false,
        }
    }

    /// Clear the change flag of every button.
    ///
    /// Does nothing if the registry is not running.
    pub fn clear_all_change_flags(&self) {
        let count = self.number_of_buttons();
        for entry in &self.entries[..count] {
            entry.take_change(true);
        }
    }

    // `count` is the only thing read here: it is zero whenever the
    // registry is stopped, and a single load can't see a half-done stop.
    fn entry(&self, button_id: usize) -> Option<&ButtonEntry> {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return None;
        }

        assert!(
            button_id < count,
            "button id {} out of range for {} buttons",
            button_id,
            count
        );

        Some(&self.entries[button_id])
    }
}

impl<Line: ButtonLine, Clk: Clock, Cfg: Debounce, const N: usize> Buttons<Line, Clk, Cfg, N> {
    /// Start monitoring the given lines.
    ///
    /// The position of each line fixes its button id.  Every line is
    /// configured as an input, and after a
    /// [`SETTLE_DELAY_MS`](crate::SETTLE_DELAY_MS) wait on `delay` its
    /// edge interrupt is armed.  All buttons start up, with no pending
    /// change.
    ///
    /// If the registry is already running it is stopped first, and the
    /// old lines are dropped.  On error the registry is left stopped and
    /// it is fine to try again.
    ///
    /// Returns [`StartError::InvalidInput`](StartError::InvalidInput) if
    /// `lines` is empty and
    /// [`StartError::AllocationFailure`](StartError::AllocationFailure)
    /// if it holds more than `N` lines.
    ///
    /// # Safety
    ///
    /// For this call to be safe, you must ensure that it is not run
    /// concurrently with a call to any unsafe method of this type,
    /// including `start()` itself.  On a single-core chip, calling it
    /// from main application code while the edge interrupt handler is
    /// the only caller of `on_edge()` is enough.
    #[inline]
    pub unsafe fn start<I, D>(&self, lines: I, delay: &mut D) -> Result<(), StartError>
    where
        I: IntoIterator<Item = Line>,
        D: DelayMs<u32>,
    {
        self.start_linted(lines, delay)
    }

    // n.b. the unsafe entry points only forward, so the unsafety
    // reasoning stays in one place.
    fn start_linted<I, D>(&self, lines: I, delay: &mut D) -> Result<(), StartError>
    where
        I: IntoIterator<Item = Line>,
        D: DelayMs<u32>,
    {
        // Dropping the previous lines is what releases them.
        drop(self.stop_linted());

        let mut collected: Vec<Line, N> = Vec::new();
        for line in lines {
            if collected.push(line).is_err() {
                #[cfg(feature = "defmt")]
                defmt::warn!("buttons: more than {=usize} lines supplied", N);
                return Err(StartError::AllocationFailure);
            }
        }

        if collected.is_empty() {
            #[cfg(feature = "defmt")]
            defmt::warn!("buttons: no lines supplied");
            return Err(StartError::InvalidInput);
        }

        for entry in &self.entries {
            entry.reset();
        }

        let lines_ptr = self.lines.get();
        // This is safe because the registry is stopped, so the edge
        // handler won't look at the lines, and the caller promises
        // nobody else is in here.
        let lines = unsafe { &mut *lines_ptr };
        *lines = collected;

        for line in lines.iter_mut() {
            line.configure_input();
        }

        delay.delay_ms(SETTLE_DELAY_MS);

        for line in lines.iter_mut() {
            line.arm_edge_interrupt();
        }

        // Edges that land before this are dropped as `NotStarted`; the
        // lines must not be touched by the handler while we hold them.
        // The accessors go live last.
        let count = lines.len();
        self.begun.store(true, Ordering::Release);
        self.count.store(count, Ordering::Release);

        #[cfg(feature = "defmt")]
        defmt::debug!("buttons: started with {=usize} lines", count);

        Ok(())
    }

    /// Stop monitoring, handing the lines back.
    ///
    /// Every line's interrupt is disarmed before its storage is
    /// released.
    ///
    /// Returns `None`, doing nothing, if the registry is not running.
    ///
    /// # Safety
    ///
    /// For this method to be safe, you must ensure that it is not run
    /// concurrently with a call to any unsafe method of this type,
    /// including `stop()` itself.
    ///
    /// If you only ever call `on_edge()` in an interrupt service
    /// routine, and your architecture guarantees that main application
    /// code never preempts an interrupt service routine, calling this
    /// from main application code will be safe.
    #[inline]
    pub unsafe fn stop(&self) -> Option<Vec<Line, N>> {
        self.stop_linted()
    }

    fn stop_linted(&self) -> Option<Vec<Line, N>> {
        if !self.begun.load(Ordering::Acquire) {
            return None;
        }

        // Unpublish first, accessors then the edge handler, so a late
        // edge bails out before it looks at the lines we are about to
        // disarm and release.
        self.count.store(0, Ordering::Release);
        self.begun.store(false, Ordering::Release);
        compiler_fence(Ordering::SeqCst);

        let lines_ptr = self.lines.get();
        // This is safe because the caller promises this is an
        // exclusive call, and the edge handler now ignores the lines.
        let lines = unsafe { &mut *lines_ptr };

        for line in lines.iter_mut() {
            line.disarm_edge_interrupt();
        }

        for entry in &self.entries {
            entry.reset();
        }

        #[cfg(feature = "defmt")]
        defmt::debug!("buttons: stopped");

        Some(core::mem::replace(lines, Vec::new()))
    }

    /// Handle an edge on any of the monitored lines.
    ///
    /// Call this from the interrupt handler shared by all the lines.
    /// It reads every line, not just the one that fired, so spurious or
    /// coalesced calls are harmless.  It never blocks or allocates.
    ///
    /// Returns an error if the registry is not running, or if a line
    /// could not be read.  In the second case the remaining lines have
    /// still been processed.
    ///
    /// # Safety
    ///
    /// For this method to be safe, you must ensure that it is not run
    /// concurrently with a call to any unsafe method of this type,
    /// including `on_edge()` itself.  The usual way to do this is to
    /// call `on_edge()` from a single interrupt service routine.
    #[inline]
    pub unsafe fn on_edge(&self) -> Result<(), EdgeError<Line::Error>> {
        self.on_edge_linted()
    }

    fn on_edge_linted(&self) -> Result<(), EdgeError<Line::Error>> {
        if !self.begun.load(Ordering::Acquire) {
            return Err(EdgeError::NotStarted);
        }

        let lines_ptr = self.lines.get();
        // This is safe because we only ever mutate in `start()` and
        // `stop()`, which never run alongside us.
        let lines = unsafe { &*lines_ptr };

        let now = self.clock.now_ms();
        let mut result = Ok(());

        for (index, (line, entry)) in lines.iter().zip(self.entries.iter()).enumerate() {
            let pressed = match Self::read(line) {
                Ok(pressed) => pressed,
                Err(error) => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("buttons: failed to read line {=usize}", index);
                    if result.is_ok() {
                        result = Err(EdgeError::Line { index, error });
                    }
                    continue;
                }
            };

            if entry.observe(pressed, now, Cfg::DELAY_MS) {
                #[cfg(feature = "defmt")]
                defmt::trace!("buttons: {=usize} -> {=bool} at {=u32}", index, pressed, now);
            }
        }

        result
    }

    #[inline(always)]
    fn read(line: &Line) -> Result<bool, Line::Error> {
        if Cfg::ACTIVE_LOW {
            line.is_low()
        } else {
            line.is_high()
        }
    }
}
