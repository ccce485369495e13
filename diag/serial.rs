//! Bare-metal serial sink (COM1).

use spin::Mutex;
use x86_64::instructions::port::Port;

const COM1: u16 = 0x3F8;

static PORT: Mutex<Port<u8>> = Mutex::new(Port::new(COM1));

pub fn write(bytes: &[u8]) {
    let mut port = PORT.lock();
    for &b in bytes {
        unsafe { port.write(b) };
    }
}
