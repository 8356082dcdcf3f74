//! Kernel log over the first UART.
//!
//! Everything of interest the core does is reported through the `log_info!`,
//! `log_warn!` and `log_error!` macros. On the kernel build they write to the
//! 16550 at 0x3F8; under `cfg(test)` the sink is the host's stderr so unit
//! tests can run the same code paths.

#[cfg(not(test))]
mod uart {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use x86_64::instructions::port::Port;

    const COM1: u16 = 0x3F8;

    pub struct SerialPort {
        data: Port<u8>,
        int_en: Port<u8>,
        fifo_ctrl: Port<u8>,
        line_ctrl: Port<u8>,
        modem_ctrl: Port<u8>,
        line_sts: Port<u8>,
    }

    impl SerialPort {
        const unsafe fn new(base: u16) -> SerialPort {
            SerialPort {
                data: Port::new(base),
                int_en: Port::new(base + 1),
                fifo_ctrl: Port::new(base + 2),
                line_ctrl: Port::new(base + 3),
                modem_ctrl: Port::new(base + 4),
                line_sts: Port::new(base + 5),
            }
        }

        fn init(&mut self) {
            unsafe {
                self.int_en.write(0x00); // no UART interrupts, we poll
                self.line_ctrl.write(0x80); // DLAB on
                self.data.write(0x03); // 38400 baud
                self.int_en.write(0x00);
                self.line_ctrl.write(0x03); // 8N1, DLAB off
                self.fifo_ctrl.write(0xC7);
                self.modem_ctrl.write(0x0B);
            }
        }

        fn send(&mut self, byte: u8) {
            unsafe {
                while (self.line_sts.read() & 0x20) == 0 {}
                self.data.write(byte);
            }
        }
    }

    impl core::fmt::Write for SerialPort {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for byte in s.bytes() {
                self.send(byte);
            }
            Ok(())
        }
    }

    lazy_static! {
        pub static ref SERIAL1: Mutex<SerialPort> = {
            let mut port = unsafe { SerialPort::new(COM1) };
            port.init();
            Mutex::new(port)
        };
    }
}

#[doc(hidden)]
#[cfg(not(test))]
pub fn _log(level: &str, args: core::fmt::Arguments) {
    use core::fmt::Write;
    let mut port = uart::SERIAL1.lock();
    let _ = write!(port, "[{}] {}\n", level, args);
}

#[doc(hidden)]
#[cfg(test)]
pub fn _log(level: &str, args: core::fmt::Arguments) {
    std::eprintln!("[{}] {}", level, args);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::serial::_log("INFO ", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::serial::_log("WARN ", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::serial::_log("ERROR", format_args!($($arg)*))
    };
}
