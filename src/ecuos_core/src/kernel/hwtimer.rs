/// A free-running hardware timer that drives a hardware counter.
///
/// The timer counts from `0` to [`max_value`](Self::max_value) and wraps
/// around. It can raise one interrupt at a programmed point; the port reports
/// that interrupt to the kernel, which reads the timer to find out how many
/// ticks elapsed.
///
/// <div class="admonition-follows"></div>
///
/// > **Relation to Other Specifications:** The methods correspond to the
/// > `HwtInit`, `HwtStart`, `HwtStop`, and `HwtRead` driver functions of a
/// > typical OSEK/AUTOSAR kernel.
///
pub trait HardwareTimer {
    /// The largest value returned by [`read`](Self::read). Must be of the
    /// form `2^n - 1`.
    fn max_value(&self) -> u32;

    /// Prepare the timer. Called once during `StartOS`.
    fn init(&mut self);

    /// Request an interrupt `delta` ticks after the timer read `old`.
    ///
    /// If that point has already passed, the interrupt must be raised as soon
    /// as possible. `delta` is never zero and never exceeds `max_value()`.
    fn start(&mut self, old: u32, delta: u32);

    /// Cancel a requested interrupt.
    fn stop(&mut self);

    /// Read the current timer value.
    fn read(&self) -> u32;
}
