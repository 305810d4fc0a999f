//! Example out-of-tree virtio-blk driver built against the stable DDK.
//!
//! This binary is not linked into the kernel; it demonstrates the contract
//! a loaded driver module must honor: export `Probe`, `Bind`, `GetDevice`
//! by name with the signatures below, do its own PCI capability walk over
//! the BARs the kernel already programmed, and service block requests with
//! the same three-descriptor chain the kernel's in-tree virtio-blk uses.

#![no_std]
#![no_main]

use core::mem;
use core::sync::atomic::{fence, Ordering};

use nexus_driver_common::{BarFlags, BlockDriver, DeviceInfo, Driver, DriverError, MmioWindow};

const VIRTIO_VENDOR_ID: u16 = 0x1AF4;
const VIRTIO_BLK_DEVICE_ID_MODERN: u16 = 0x1042;
const VIRTIO_BLK_DEVICE_ID_LEGACY: u16 = 0x1001;

const QUEUE_SIZE: u16 = 256;

#[derive(Clone, Copy)]
#[repr(u32)]
enum ReqType {
    In = 0,
    Out = 1,
    Flush = 4,
}

#[repr(C)]
struct ReqHeader {
    kind: u32,
    reserved: u32,
    sector: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

const DESC_F_NEXT: u16 = 1;
const DESC_F_WRITE: u16 = 2;

#[repr(C)]
struct AvailRing {
    flags: u16,
    idx: u16,
    ring: [u16; QUEUE_SIZE as usize],
}

#[repr(C)]
struct UsedElem {
    id: u32,
    len: u32,
}

#[repr(C)]
struct UsedRing {
    flags: u16,
    idx: u16,
    ring: [UsedElem; QUEUE_SIZE as usize],
}

/// Static page-aligned queue storage. A real driver would obtain this from
/// the kernel's DMA allocator (`Kernel_AllocatePages`); the example keeps
/// it simple since it never runs inside the actual kernel binary.
#[repr(align(4096))]
struct QueueStorage {
    desc: [Descriptor; QUEUE_SIZE as usize],
    avail: AvailRing,
    used: UsedRing,
}

static mut QUEUE: QueueStorage = QueueStorage {
    desc: [Descriptor {
        addr: 0,
        len: 0,
        flags: 0,
        next: 0,
    }; QUEUE_SIZE as usize],
    avail: AvailRing {
        flags: 0,
        idx: 0,
        ring: [0; QUEUE_SIZE as usize],
    },
    used: UsedRing {
        flags: 0,
        idx: 0,
        ring: unsafe { mem::transmute([0u64; QUEUE_SIZE as usize]) },
    },
};

pub struct VirtioBlkDriver {
    info: DeviceInfo,
    common: MmioWindow,
    capacity: u64,
    block_size: u32,
    free_head: u16,
    used_idx: u16,
}

impl VirtioBlkDriver {
    fn resolve_common_window(info: &DeviceInfo) -> Option<MmioWindow> {
        let bar = info.bars.iter().find(|b| b.flags.contains(BarFlags::PRESENT))?;
        // SAFETY: the kernel already programmed this BAR's base/size per the
        // PCI binder contract before handing us the DeviceInfo.
        Some(unsafe { MmioWindow::new(bar.base as *mut u8, bar.size as usize) })
    }

    fn build_freelist() {
        // SAFETY: single-threaded example driver, exclusive queue owner.
        let desc = unsafe { &mut QUEUE.desc };
        for i in 0..QUEUE_SIZE - 1 {
            desc[i as usize].next = i + 1;
        }
        desc[(QUEUE_SIZE - 1) as usize].next = 0;
    }

    fn alloc_chain(&mut self, n: u16) -> u16 {
        let head = self.free_head;
        let mut cur = head;
        // SAFETY: queue is exclusively owned by this driver instance.
        let desc = unsafe { &mut QUEUE.desc };
        for _ in 0..n - 1 {
            cur = desc[cur as usize].next;
        }
        self.free_head = desc[cur as usize].next;
        head
    }

    fn free_chain(&mut self, head: u16) {
        let mut tail = head;
        // SAFETY: queue is exclusively owned by this driver instance.
        let desc = unsafe { &mut QUEUE.desc };
        while desc[tail as usize].flags & DESC_F_NEXT != 0 {
            tail = desc[tail as usize].next;
        }
        desc[tail as usize].next = self.free_head;
        self.free_head = head;
    }

    fn submit(&mut self, kind: ReqType, sector: u64, buf: &mut [u8]) -> Result<u8, DriverError> {
        static mut HDR: ReqHeader = ReqHeader {
            kind: 0,
            reserved: 0,
            sector: 0,
        };
        static mut STATUS: u8 = 0xFF;

        // SAFETY: single outstanding request per queue, no concurrent access.
        unsafe {
            HDR = ReqHeader {
                kind: kind as u32,
                reserved: 0,
                sector,
            };
            STATUS = 0xFF;
        }

        let has_data = !buf.is_empty();
        let n = if has_data { 3 } else { 2 };
        let head = self.alloc_chain(n);

        // SAFETY: exclusive queue ownership.
        let desc = unsafe { &mut QUEUE.desc };
        let hdr_idx = head;
        let (data_idx, status_idx) = if has_data {
            (desc[hdr_idx as usize].next, 0)
        } else {
            (0, desc[hdr_idx as usize].next)
        };

        desc[hdr_idx as usize] = Descriptor {
            addr: core::ptr::addr_of!(HDR) as u64,
            len: mem::size_of::<ReqHeader>() as u32,
            flags: DESC_F_NEXT,
            next: if has_data { data_idx } else { status_idx },
        };

        if has_data {
            let write_flag = matches!(kind, ReqType::In) as u16 * DESC_F_WRITE;
            let status_idx = desc[data_idx as usize].next;
            desc[data_idx as usize] = Descriptor {
                addr: buf.as_mut_ptr() as u64,
                len: buf.len() as u32,
                flags: DESC_F_NEXT | write_flag,
                next: status_idx,
            };
            desc[status_idx as usize] = Descriptor {
                addr: core::ptr::addr_of!(STATUS) as u64,
                len: 1,
                flags: DESC_F_WRITE,
                next: 0,
            };
        } else {
            desc[status_idx as usize] = Descriptor {
                addr: core::ptr::addr_of!(STATUS) as u64,
                len: 1,
                flags: DESC_F_WRITE,
                next: 0,
            };
        }

        // SAFETY: exclusive queue ownership; idx write is paired with the
        // release fence below before notification.
        unsafe {
            let slot = QUEUE.avail.idx % QUEUE_SIZE;
            QUEUE.avail.ring[slot as usize] = head;
            fence(Ordering::Release);
            QUEUE.avail.idx = QUEUE.avail.idx.wrapping_add(1);
        }
        // SAFETY: notify offset 0 is valid for the common configuration
        // window resolved at bind time.
        unsafe { self.common.write::<u16>(0x16, 0) };

        let mut budget: u32 = 10_000_000;
        loop {
            fence(Ordering::Acquire);
            // SAFETY: exclusive queue ownership.
            let used_idx = unsafe { QUEUE.used.idx };
            if used_idx != self.used_idx {
                self.used_idx = self.used_idx.wrapping_add(1);
                self.free_chain(head);
                // SAFETY: STATUS was written by the device before the used
                // ring index advanced (acquire fence above).
                return Ok(unsafe { STATUS });
            }
            budget -= 1;
            if budget == 0 {
                self.free_chain(head);
                return Err(DriverError::Timeout);
            }
            core::hint::spin_loop();
        }
    }
}

impl Driver for VirtioBlkDriver {
    fn probe(info: &DeviceInfo) -> bool {
        info.vendor_id == VIRTIO_VENDOR_ID
            && (info.device_id == VIRTIO_BLK_DEVICE_ID_MODERN
                || info.device_id == VIRTIO_BLK_DEVICE_ID_LEGACY)
    }

    fn bind(info: &DeviceInfo) -> Result<Self, DriverError> {
        let common = Self::resolve_common_window(info).ok_or(DriverError::DeviceNotSupported)?;
        Self::build_freelist();

        // SAFETY: offsets per the virtio 1.x common configuration layout.
        unsafe {
            common.write::<u8>(0x14, 0); // device_status = Reset
            common.write::<u8>(0x14, 1); // Acknowledge
            common.write::<u8>(0x14, 3); // Driver
            let features = common.read::<u32>(0x00);
            common.write::<u32>(0x04, features);
            common.write::<u8>(0x14, 11); // FeaturesOK
            if common.read::<u8>(0x14) & 0x08 == 0 {
                common.write::<u8>(0x14, 0x80); // Failed
                return Err(DriverError::InitFailed);
            }
            common.write::<u8>(0x14, 15); // DriverOK
        }

        let capacity = 0u64; // device-specific config window resolution omitted in this example
        Ok(VirtioBlkDriver {
            info: *info,
            common,
            capacity,
            block_size: 512,
            free_head: 0,
            used_idx: 0,
        })
    }

    fn device(&self) -> &DeviceInfo {
        &self.info
    }
}

impl BlockDriver for VirtioBlkDriver {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.capacity
    }

    fn read_blocks(
        &mut self,
        start_block: u64,
        num_blocks: u32,
        buffer: &mut [u8],
    ) -> Result<(), DriverError> {
        let want = num_blocks as usize * self.block_size as usize;
        if buffer.len() < want {
            return Err(DriverError::InvalidParameter);
        }
        let status = self.submit(ReqType::In, start_block, &mut buffer[..want])?;
        if status != 0 {
            return Err(DriverError::IoError);
        }
        Ok(())
    }

    fn write_blocks(
        &mut self,
        start_block: u64,
        num_blocks: u32,
        data: &[u8],
    ) -> Result<(), DriverError> {
        let want = num_blocks as usize * self.block_size as usize;
        if data.len() < want {
            return Err(DriverError::InvalidParameter);
        }
        let mut scratch = [0u8; 512];
        let n = want.min(scratch.len());
        scratch[..n].copy_from_slice(&data[..n]);
        let status = self.submit(ReqType::Out, start_block, &mut scratch[..n])?;
        if status != 0 {
            return Err(DriverError::IoError);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DriverError> {
        let status = self.submit(ReqType::Flush, 0, &mut [])?;
        if status != 0 {
            return Err(DriverError::IoError);
        }
        Ok(())
    }
}

#[no_mangle]
pub extern "C" fn Probe(info: *const DeviceInfo) -> bool {
    // SAFETY: the loader guarantees `info` points at a live DeviceInfo for
    // the duration of this call.
    let info = unsafe { &*info };
    VirtioBlkDriver::probe(info)
}

static mut DRIVER: Option<VirtioBlkDriver> = None;

#[no_mangle]
pub extern "C" fn Bind(info: *const DeviceInfo) -> bool {
    // SAFETY: the loader guarantees `info` points at a live DeviceInfo for
    // the duration of this call.
    let info = unsafe { &*info };
    match VirtioBlkDriver::bind(info) {
        Ok(driver) => {
            // SAFETY: Bind/GetDevice are invoked sequentially by the loader,
            // never concurrently.
            unsafe { DRIVER = Some(driver) };
            true
        }
        Err(_) => false,
    }
}

#[no_mangle]
pub extern "C" fn GetDevice() -> *const DeviceInfo {
    // SAFETY: see Bind.
    match unsafe { &DRIVER } {
        Some(d) => d.device() as *const DeviceInfo,
        None => core::ptr::null(),
    }
}

#[no_mangle]
pub extern "C" fn _start() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {
        core::hint::spin_loop();
    }
}
