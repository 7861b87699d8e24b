use rngfeed_core::{EXIT_SUCCESS, HrngPreset};

pub fn run() -> i32 {
    println!(
        "  {:<10} {:<40} {:>6} {:>8} {:>8}  {}",
        "PRESET", "DESCRIPTION", "WIDTH", "BUFFERS", "ENTROPY", "DRIVER"
    );
    for preset in HrngPreset::ALL {
        let p = preset.params();
        println!(
            "  {:<10} {:<40} {:>6} {:>8} {:>8.3}  {}",
            p.tag, p.name, p.continuous_width_bits, p.buffers, p.entropy_factor, p.driver
        );
    }
    EXIT_SUCCESS
}
