use linux_embedded_hal::I2cdev;
use mcp342x::{Channel, Config, Gain, MCP342x, Resolution};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let i2c = I2cdev::new("/dev/i2c-1")?;
    let mut adc = MCP342x::new(i2c);
    let config = Config::new(Channel::Ch3, Resolution::Bits16, Gain::G1);
    adc.configure(0x68, &config)?;
    std::thread::sleep(Resolution::Bits16.conversion_time());
    let sample = adc.read_sample(0x68, &config)?;
    let volts = f64::from(sample.code) * config.resolution.lsb() / f64::from(config.gain.factor());
    println!("Voltage: {:.6} V ({})", volts, sample.status);
    Ok(())
}
