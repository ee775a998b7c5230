use iio_source::ChannelKind;

/// Unit of a channel kind after scale and offset, following the kernel IIO ABI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitRule {
    pub kind: ChannelKind,
    pub unit: &'static str,
}

/// Extend by adding rows; lookups are linear and the table is small.
pub const UNIT_TABLE: &[UnitRule] = &[
    UnitRule { kind: ChannelKind::Temperature, unit: "millidegree_celsius" },
    UnitRule { kind: ChannelKind::Humidity, unit: "millipercent" },
    UnitRule { kind: ChannelKind::Pressure, unit: "kilopascal" },
    UnitRule { kind: ChannelKind::Illuminance, unit: "lux" },
    UnitRule { kind: ChannelKind::Intensity, unit: "counts" },
    UnitRule { kind: ChannelKind::Proximity, unit: "counts" },
    UnitRule { kind: ChannelKind::AngularVelocity, unit: "radian_per_second" },
    UnitRule { kind: ChannelKind::Acceleration, unit: "meter_per_second_squared" },
    UnitRule { kind: ChannelKind::MagneticField, unit: "gauss" },
    UnitRule { kind: ChannelKind::Voltage, unit: "millivolt" },
    UnitRule { kind: ChannelKind::Current, unit: "milliampere" },
    UnitRule { kind: ChannelKind::Concentration, unit: "percent" },
    UnitRule { kind: ChannelKind::Distance, unit: "meter" },
];

pub const UNKNOWN_UNIT: &str = "raw";

pub fn unit_for(kind: ChannelKind) -> &'static str {
    UNIT_TABLE
        .iter()
        .find(|r| r.kind == kind)
        .map(|r| r.unit)
        .unwrap_or(UNKNOWN_UNIT)
}
