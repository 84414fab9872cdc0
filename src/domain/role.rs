use serde::{Deserialize, Serialize};

/// The single active role of the person operating the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Accountant,
    Teacher,
    Student,
    Parent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ManageAcademicYears,
    ManageTeachers,
    ManageClasses,
    ViewClasses,
    ManageStudents,
    ViewStudents,
    ManageEnrollments,
    ViewFees,
    ManageFees,
    RecordPayments,
    ApplyDiscounts,
    ReverseTransactions,
    ViewReports,
    ExportData,
    ViewSecurityLog,
}

impl Permission {
    pub const ALL: &'static [Permission] = &[
        Permission::ManageAcademicYears,
        Permission::ManageTeachers,
        Permission::ManageClasses,
        Permission::ViewClasses,
        Permission::ManageStudents,
        Permission::ViewStudents,
        Permission::ManageEnrollments,
        Permission::ViewFees,
        Permission::ManageFees,
        Permission::RecordPayments,
        Permission::ApplyDiscounts,
        Permission::ReverseTransactions,
        Permission::ViewReports,
        Permission::ExportData,
        Permission::ViewSecurityLog,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ManageAcademicYears => "manage_academic_years",
            Permission::ManageTeachers => "manage_teachers",
            Permission::ManageClasses => "manage_classes",
            Permission::ViewClasses => "view_classes",
            Permission::ManageStudents => "manage_students",
            Permission::ViewStudents => "view_students",
            Permission::ManageEnrollments => "manage_enrollments",
            Permission::ViewFees => "view_fees",
            Permission::ManageFees => "manage_fees",
            Permission::RecordPayments => "record_payments",
            Permission::ApplyDiscounts => "apply_discounts",
            Permission::ReverseTransactions => "reverse_transactions",
            Permission::ViewReports => "view_reports",
            Permission::ExportData => "export_data",
            Permission::ViewSecurityLog => "view_security_log",
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

const ACCOUNTANT_PERMISSIONS: &[Permission] = &[
    Permission::ViewStudents,
    Permission::ViewFees,
    Permission::ManageFees,
    Permission::RecordPayments,
    Permission::ApplyDiscounts,
    Permission::ReverseTransactions,
    Permission::ViewReports,
    Permission::ExportData,
];

const TEACHER_PERMISSIONS: &[Permission] = &[
    Permission::ViewStudents,
    Permission::ViewClasses,
    Permission::ManageEnrollments,
];

const FAMILY_PERMISSIONS: &[Permission] = &[Permission::ViewFees];

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Accountant => "accountant",
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Parent => "parent",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "accountant" => Some(Role::Accountant),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            "parent" => Some(Role::Parent),
            _ => None,
        }
    }

    /// The fixed permission set granted to this role.
    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Role::Admin => Permission::ALL,
            Role::Accountant => ACCOUNTANT_PERMISSIONS,
            Role::Teacher => TEACHER_PERMISSIONS,
            Role::Student | Role::Parent => FAMILY_PERMISSIONS,
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Who is performing an operation. Recorded on history rows and security events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }

    /// The built-in administrator used when no actor is supplied.
    pub fn system() -> Self {
        Self::new("system", Role::Admin)
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.role.can(permission)
    }
}
