#![no_main]
use libfuzzer_sys::fuzz_target;
use lmem_core::config::{AllocatorConfig, CheckMode};
use lmem_core::malloc::{MallocState, SimulatedMemory};

const MAX_LEN: usize = 1 << 18;

fuzz_target!(|data: &[u8]| {
    // Byte 0 picks the configuration, then 4-byte chunks are operations.
    let Some((&flags, ops)) = data.split_first() else {
        return;
    };
    let mode = if flags & 1 == 0 {
        CheckMode::Compat
    } else {
        CheckMode::Checked
    };
    let config = AllocatorConfig::new()
        .with_mode(mode)
        .with_mmap(flags & 2 == 0);
    let mut state = MallocState::with_config(SimulatedMemory::with_heap_limit(16 << 20), config);
    let mut live: Vec<(usize, usize, u8)> = Vec::new();

    for (step, chunk) in ops.chunks_exact(4).enumerate() {
        let op = chunk[0] % 5;
        let len = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]))
            * (1 + usize::from(chunk[3] % 4))
            % MAX_LEN;
        let tag = chunk[3] | 1;

        match op {
            0 | 1 => {
                if let Ok(ptr) = state.malloc(len) {
                    state.memory_mut().fill(ptr, tag, len.min(64));
                    live.push((ptr, len, tag));
                }
            }
            2 => {
                let count = usize::from(chunk[3] % 8) + 1;
                if let Ok(ptr) = state.calloc(count, len / count) {
                    let total = (len / count) * count;
                    assert!(
                        state.memory().read(ptr, total.min(64)).iter().all(|&b| b == 0),
                        "calloc returned dirty memory"
                    );
                    live.push((ptr, total, 0));
                }
            }
            3 => {
                if !live.is_empty() {
                    let (ptr, old_len, tag) = live.swap_remove(step % live.len());
                    assert!(
                        state.memory().read(ptr, old_len.min(64)).iter().all(|&b| b == tag),
                        "block contents changed while live"
                    );
                    state.free(ptr);
                }
            }
            _ => {
                if !live.is_empty() {
                    let index = step % live.len();
                    let (ptr, old_len, tag) = live[index];
                    // Compat resize copies the requested length from the old
                    // block, so only shrinking stays inside memory we own.
                    let len = if mode == CheckMode::Compat {
                        len.min(old_len)
                    } else {
                        len
                    };
                    if let Ok(new_ptr) = state.realloc(ptr, len) {
                        let kept = old_len.min(len).min(64);
                        assert!(
                            state.memory().read(new_ptr, kept).iter().all(|&b| b == tag),
                            "realloc lost the payload prefix"
                        );
                        state.memory_mut().fill(new_ptr, tag, len.min(64));
                        live[index] = (new_ptr, len, tag);
                    }
                }
            }
        }

        if let Err(err) = state.audit() {
            panic!("heap invariant broken after step {step}: {err}");
        }
    }

    for (ptr, _, _) in live {
        state.free(ptr);
    }
    let summary = state.audit().expect("heap intact after draining");
    assert_eq!(summary.blocks, summary.free_blocks, "every block released");
});
