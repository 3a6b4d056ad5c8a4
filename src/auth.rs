//! Role-based access rules. Every handler goes through this module; a
//! failed check is an explicit denial, results are never silently
//! narrowed instead.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Self::Admin),
            "teacher" => Some(Self::Teacher),
            "student" => Some(Self::Student),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Teacher => "teacher",
            Self::Student => "student",
            Self::Parent => "parent",
        }
    }
}

/// The authenticated caller, as established by `session.login`.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
}

/// A failed policy check, rendered as a `forbidden` error at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denied(pub &'static str);

pub fn ensure_admin(p: &Principal) -> Result<(), Denied> {
    match p.role {
        Role::Admin => Ok(()),
        _ => Err(Denied("requires the admin role")),
    }
}

/// Grade creation is open to admins and teachers.
pub fn ensure_staff(p: &Principal) -> Result<(), Denied> {
    match p.role {
        Role::Admin | Role::Teacher => Ok(()),
        _ => Err(Denied("requires the admin or teacher role")),
    }
}

/// A grade may be mutated by an admin or by the teacher who authored it.
pub fn ensure_grade_write(p: &Principal, author_teacher_id: &str) -> Result<(), Denied> {
    match p.role {
        Role::Admin => Ok(()),
        Role::Teacher if p.user_id == author_teacher_id => Ok(()),
        Role::Teacher => Err(Denied("grade belongs to another teacher")),
        _ => Err(Denied("requires the admin or teacher role")),
    }
}

/// Read access to a single grade/attendance row of one student.
pub fn ensure_student_record_view(
    p: &Principal,
    homeroom_teacher_id: Option<&str>,
    student_user_id: &str,
    guardian_user_id: Option<&str>,
) -> Result<(), Denied> {
    match p.role {
        Role::Admin => Ok(()),
        Role::Teacher if homeroom_teacher_id == Some(p.user_id.as_str()) => Ok(()),
        Role::Teacher => Err(Denied("student is not in one of your classes")),
        Role::Student if p.user_id == student_user_id => Ok(()),
        Role::Student => Err(Denied("students may only view their own records")),
        Role::Parent if guardian_user_id == Some(p.user_id.as_str()) => Ok(()),
        Role::Parent => Err(Denied("parents may only view their linked child's records")),
    }
}

/// Attendance is recorded by an admin or by the homeroom teacher of the
/// student's class.
pub fn ensure_attendance_record(
    p: &Principal,
    homeroom_teacher_id: Option<&str>,
) -> Result<(), Denied> {
    match p.role {
        Role::Admin => Ok(()),
        Role::Teacher if homeroom_teacher_id == Some(p.user_id.as_str()) => Ok(()),
        Role::Teacher => Err(Denied("student is not in one of your classes")),
        _ => Err(Denied("requires the admin or teacher role")),
    }
}

/// An attendance row may be corrected by an admin or by the teacher who
/// recorded it.
pub fn ensure_attendance_write(p: &Principal, recorded_by: &str) -> Result<(), Denied> {
    match p.role {
        Role::Admin => Ok(()),
        Role::Teacher if p.user_id == recorded_by => Ok(()),
        Role::Teacher => Err(Denied("attendance was recorded by another teacher")),
        _ => Err(Denied("requires the admin or teacher role")),
    }
}

/// Schedules are managed by an admin or by the homeroom teacher of the
/// class they belong to.
pub fn ensure_schedule_manage(
    p: &Principal,
    class_teacher_id: Option<&str>,
) -> Result<(), Denied> {
    match p.role {
        Role::Admin => Ok(()),
        Role::Teacher if class_teacher_id == Some(p.user_id.as_str()) => Ok(()),
        Role::Teacher => Err(Denied("you are not homeroom teacher of this class")),
        _ => Err(Denied("requires the admin or teacher role")),
    }
}
